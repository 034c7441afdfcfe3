//! IMAP implementation of [`RemoteSession`]
//!
//! Every remote call is wrapped in a bounded timeout so a hung server
//! surfaces as the typed timeout error instead of stalling the operation
//! queue forever.

use std::future::Future;
use std::time::Duration;

use async_imap::types::{Fetch, Flag, UnsolicitedResponse};
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::error::{HeimdallError, HeimdallResult};
use crate::message::MessageFlags;

use super::session::{
    Capabilities, ContainerStatus, FetchedMessage, RemoteContainerInfo, RemoteSession,
    SessionEvent, UidAttributes, UidSet,
};

type ImapTransportStream = TlsStream<Compat<TcpStream>>;

/// The subset of the opaque connection-settings blob this adapter reads
#[derive(Debug, Clone, Deserialize)]
pub struct ImapCredentials {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub imap_password: String,
}

/// A live IMAP session over TLS
pub struct ImapSession {
    session: Session<ImapTransportStream>,
    capabilities: Capabilities,
    timeout: Duration,
}

async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> HeimdallResult<T>
where
    F: Future<Output = HeimdallResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(HeimdallError::timeout(what)),
    }
}

fn flags_of(fetch: &Fetch) -> MessageFlags {
    let raw: Vec<String> = fetch
        .flags()
        .map(|f| match f {
            Flag::Seen => "\\Seen".to_string(),
            Flag::Answered => "\\Answered".to_string(),
            Flag::Flagged => "\\Flagged".to_string(),
            Flag::Deleted => "\\Deleted".to_string(),
            Flag::Draft => "\\Draft".to_string(),
            Flag::Recent => "\\Recent".to_string(),
            Flag::MayCreate => "\\*".to_string(),
            Flag::Custom(name) => name.to_string(),
        })
        .collect();
    MessageFlags::from_imap(&raw)
}

impl ImapSession {
    /// Dial, authenticate and negotiate capabilities
    pub async fn connect(
        connection_settings: &serde_json::Value,
        timeout: Duration,
    ) -> HeimdallResult<Self> {
        let creds: ImapCredentials = serde_json::from_value(connection_settings.clone())?;

        info!(host = %creds.imap_host, port = creds.imap_port, "connecting to mailbox server");

        let dial = TcpStream::connect((creds.imap_host.as_str(), creds.imap_port));
        let tcp = match tokio::time::timeout(timeout, dial).await {
            Ok(stream) => stream?,
            Err(_) => return Err(HeimdallError::timeout("tcp connect")),
        };

        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls.connect(&creds.imap_host, tcp.compat()).await?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&creds.imap_username, &creds.imap_password)
            .await
            .map_err(|(err, _client)| HeimdallError::from(err))?;

        let caps = session.capabilities().await?;
        let capabilities = Capabilities {
            labels: caps.has_str("X-GM-EXT-1"),
            condstore: caps.has_str("CONDSTORE"),
            esearch: caps.has_str("ESEARCH"),
            quota: caps.has_str("QUOTA"),
            idle: caps.has_str("IDLE"),
        };
        debug!(?capabilities, "negotiated session capabilities");

        Ok(Self { session, capabilities, timeout })
    }
}

#[async_trait]
impl RemoteSession for ImapSession {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn list_containers(&mut self) -> HeimdallResult<Vec<RemoteContainerInfo>> {
        let session = &mut self.session;
        bounded(self.timeout, "list containers", async move {
            let names: Vec<_> = session
                .list(None, Some("*"))
                .await?
                .try_collect()
                .await?;
            Ok(names
                .iter()
                .map(|name| RemoteContainerInfo {
                    name: name.name().to_string(),
                    attributes: name
                        .attributes()
                        .iter()
                        .map(|a| format!("{a:?}"))
                        .collect(),
                })
                .collect())
        })
        .await
    }

    async fn open_container(&mut self, name: &str) -> HeimdallResult<ContainerStatus> {
        let session = &mut self.session;
        bounded(self.timeout, "open container", async move {
            let mailbox = session.select(name).await?;
            Ok(ContainerStatus {
                uidnext: mailbox.uid_next.unwrap_or(1),
                uidvalidity: mailbox.uid_validity.unwrap_or(0),
                exists: mailbox.exists,
            })
        })
        .await
    }

    async fn fetch_full(&mut self, uids: &UidSet) -> HeimdallResult<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids.to_string();
        let session = &mut self.session;
        bounded(self.timeout, "fetch messages", async move {
            let fetches: Vec<Fetch> = session
                .uid_fetch(&set, "(UID FLAGS BODY.PEEK[])")
                .await?
                .try_collect()
                .await?;
            Ok(fetches
                .iter()
                .filter_map(|fetch| {
                    let uid = fetch.uid?;
                    let raw = fetch.body()?.to_vec();
                    Some(FetchedMessage {
                        uid,
                        flags: flags_of(fetch),
                        raw,
                        // imap-proto does not surface provider extension
                        // attributes on FETCH; label/conversation hints come
                        // from container membership instead.
                        labels: Vec::new(),
                        remote_thread_id: None,
                    })
                })
                .collect())
        })
        .await
    }

    async fn fetch_attributes(&mut self, uids: &UidSet) -> HeimdallResult<Vec<UidAttributes>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids.to_string();
        let session = &mut self.session;
        bounded(self.timeout, "fetch attributes", async move {
            let fetches: Vec<Fetch> = session
                .uid_fetch(&set, "(UID FLAGS)")
                .await?
                .try_collect()
                .await?;
            Ok(fetches
                .iter()
                .filter_map(|fetch| {
                    fetch.uid.map(|uid| UidAttributes { uid, flags: flags_of(fetch) })
                })
                .collect())
        })
        .await
    }

    async fn search_header(&mut self, header: &str, value: &str) -> HeimdallResult<Vec<u32>> {
        let query = format!("HEADER {header} \"{value}\"");
        let session = &mut self.session;
        bounded(self.timeout, "header search", async move {
            let found = session.uid_search(&query).await?;
            let mut uids: Vec<u32> = found.into_iter().collect();
            uids.sort_unstable();
            Ok(uids)
        })
        .await
    }

    async fn append(&mut self, container: &str, raw: &[u8]) -> HeimdallResult<()> {
        let session = &mut self.session;
        bounded(self.timeout, "append", async move {
            session.append(container, raw).await?;
            Ok(())
        })
        .await
    }

    async fn move_uid(&mut self, uid: u32, target: &str) -> HeimdallResult<()> {
        let set = uid.to_string();
        let session = &mut self.session;
        bounded(self.timeout, "move", async move {
            session.uid_mv(&set, target).await?;
            Ok(())
        })
        .await
    }

    async fn add_flags(&mut self, uid: u32, flags: &[&str]) -> HeimdallResult<()> {
        let set = uid.to_string();
        let query = format!("+FLAGS ({})", flags.join(" "));
        let session = &mut self.session;
        bounded(self.timeout, "store flags", async move {
            let _updates: Vec<Fetch> = session
                .uid_store(&set, &query)
                .await?
                .try_collect()
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_labels(&mut self, uid: u32, labels: &[String]) -> HeimdallResult<()> {
        if !self.capabilities.labels {
            return Err(HeimdallError::invalid_state(
                "session does not support per-message labels",
            ));
        }
        let set = uid.to_string();
        let rendered = labels
            .iter()
            .map(|l| format!("\"{l}\""))
            .collect::<Vec<_>>()
            .join(" ");
        let query = format!("X-GM-LABELS ({rendered})");
        let session = &mut self.session;
        bounded(self.timeout, "store labels", async move {
            let _updates: Vec<Fetch> = session
                .uid_store(&set, &query)
                .await?
                .try_collect()
                .await?;
            Ok(())
        })
        .await
    }

    fn poll_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(response) = self.session.unsolicited_responses.try_recv() {
            match response {
                UnsolicitedResponse::Exists(_) | UnsolicitedResponse::Recent(_) => {
                    events.push(SessionEvent::NewMail)
                }
                UnsolicitedResponse::Expunge(_) => events.push(SessionEvent::FlagsChanged),
                _ => {}
            }
        }
        events
    }

    async fn close(&mut self) -> HeimdallResult<()> {
        let session = &mut self.session;
        bounded(self.timeout, "logout", async move {
            session.logout().await?;
            Ok(())
        })
        .await
    }
}
