//! Test fixtures: a scripted remote mailbox, a failure-injecting transport,
//! and store builders. Compiled for tests only.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::Account;
use crate::connection::{
    Capabilities, ContainerStatus, FetchedMessage, MailTransport, RemoteContainerInfo,
    RemoteSession, SessionEvent, SessionFactory, UidAttributes, UidSet,
};
use crate::error::{HeimdallError, HeimdallResult};
use crate::folder::{Container, ContainerKind};
use crate::message::{Message, MessageDraft, MessageFlags, Participant};
use crate::storage::{StorageManager, Store};

/// A deterministic RFC 2822 message; identical inputs hash identically
/// across "fetches", which the dedup tests rely on.
pub fn raw_mail(from: &str, subject: &str, body: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(from.as_bytes());
    hasher.update(subject.as_bytes());
    let message_id = format!("<{}@fake>", hex::encode(&hasher.finalize()[..8]));
    format!(
        "Message-ID: {message_id}\r\nFrom: {from}\r\nTo: dest@example.com\r\n\
         Subject: {subject}\r\nDate: Thu, 01 Feb 2024 10:00:00 +0000\r\n\r\n{body}"
    )
    .into_bytes()
}

/// A standalone persisted message for store-level tests
pub fn test_message(account_id: Uuid, subject: &str, unix_date: i64) -> Message {
    let container = Container::new(account_id, "TESTBOX", ContainerKind::Folder);
    let mut draft = MessageDraft::from_fetch(
        account_id,
        container,
        1,
        Vec::new(),
        MessageFlags { unread: true, starred: false },
    );
    draft.subject = subject.to_string();
    draft.body = format!("body of {subject}");
    draft.snippet = draft.body.clone();
    draft.header_message_id = Some(format!("<{subject}-{unix_date}@test>"));
    draft.date = OffsetDateTime::from_unix_timestamp(unix_date)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());
    draft.from = vec![Participant::new(Some("Alice"), "alice@example.com")];
    let mut message = draft.into_message(1);
    message.folder_id = None;
    message
}

/// An opened per-account store on a scratch directory
pub fn test_store() -> (Arc<Store>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store =
        Store::open(Uuid::new_v4(), &dir.path().join("account.db")).expect("open store");
    (Arc::new(store), dir)
}

/// A full storage manager on a scratch directory
pub fn test_storage() -> (StorageManager, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = StorageManager::open(dir.path().to_path_buf()).expect("open storage");
    (manager, dir)
}

struct FakeStoredMessage {
    raw: Vec<u8>,
    flags: MessageFlags,
    labels: Vec<String>,
    remote_thread_id: Option<String>,
}

/// One scripted remote container
pub struct FakeMailbox {
    uidnext: u32,
    uidvalidity: u32,
    messages: BTreeMap<u32, FakeStoredMessage>,
}

impl FakeMailbox {
    pub fn new(uidnext: u32, uidvalidity: u32) -> Self {
        Self { uidnext, uidvalidity, messages: BTreeMap::new() }
    }

    pub fn put(&mut self, uid: u32, raw: Vec<u8>, flags: MessageFlags) {
        self.messages.insert(
            uid,
            FakeStoredMessage { raw, flags, labels: Vec::new(), remote_thread_id: None },
        );
    }

    pub fn put_threaded(
        &mut self,
        uid: u32,
        raw: Vec<u8>,
        flags: MessageFlags,
        remote_thread_id: &str,
    ) {
        self.messages.insert(
            uid,
            FakeStoredMessage {
                raw,
                flags,
                labels: Vec::new(),
                remote_thread_id: Some(remote_thread_id.to_string()),
            },
        );
    }
}

/// A scripted remote session over in-memory mailboxes
#[derive(Default)]
pub struct FakeSession {
    mailboxes: BTreeMap<String, FakeMailbox>,
    open: Option<String>,
    labels_capability: bool,
    fail_listing: bool,
    fetch_log: Arc<Mutex<Vec<String>>>,
    appended: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    events: Vec<SessionEvent>,
}

impl FakeSession {
    pub fn insert_mailbox(&mut self, name: &str, mailbox: FakeMailbox) {
        self.mailboxes.insert(name.to_string(), mailbox);
    }

    pub fn set_label_capability(&mut self, labels: bool) {
        self.labels_capability = labels;
    }

    /// Make `list_containers` fail with a transport-fatal error
    pub fn fail_listing_with_transport_error(&mut self) {
        self.fail_listing = true;
    }

    /// Every UID set passed to `fetch_full`, in call order
    pub fn fetch_recorder(&self) -> Arc<Mutex<Vec<String>>> {
        self.fetch_log.clone()
    }

    /// Raw appends, as (container, bytes)
    pub fn append_log(&self) -> Arc<Mutex<Vec<(String, Vec<u8>)>>> {
        self.appended.clone()
    }

    pub fn push_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    fn open_mailbox(&mut self) -> HeimdallResult<(&mut FakeMailbox, String)> {
        let name = self
            .open
            .clone()
            .ok_or_else(|| HeimdallError::invalid_state("no container open"))?;
        let mailbox = self
            .mailboxes
            .get_mut(&name)
            .ok_or_else(|| HeimdallError::container(format!("unknown container {name}")))?;
        Ok((mailbox, name))
    }

    fn selected_uids(mailbox: &FakeMailbox, uids: &UidSet) -> Vec<u32> {
        mailbox
            .messages
            .keys()
            .copied()
            .filter(|uid| match uids {
                UidSet::RangeFrom(start) => uid >= start,
                UidSet::Range(start, end) => uid >= start && uid <= end,
                UidSet::List(list) => list.contains(uid),
            })
            .collect()
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn capabilities(&self) -> Capabilities {
        Capabilities { labels: self.labels_capability, idle: true, ..Default::default() }
    }

    async fn list_containers(&mut self) -> HeimdallResult<Vec<RemoteContainerInfo>> {
        if self.fail_listing {
            return Err(HeimdallError::connection("scripted listing failure"));
        }
        Ok(self
            .mailboxes
            .keys()
            .map(|name| RemoteContainerInfo { name: name.clone(), attributes: Vec::new() })
            .collect())
    }

    async fn open_container(&mut self, name: &str) -> HeimdallResult<ContainerStatus> {
        let mailbox = self
            .mailboxes
            .get(name)
            .ok_or_else(|| HeimdallError::container(format!("unknown container {name}")))?;
        self.open = Some(name.to_string());
        Ok(ContainerStatus {
            uidnext: mailbox.uidnext,
            uidvalidity: mailbox.uidvalidity,
            exists: mailbox.messages.len() as u32,
        })
    }

    async fn fetch_full(&mut self, uids: &UidSet) -> HeimdallResult<Vec<FetchedMessage>> {
        self.fetch_log.lock().unwrap().push(uids.to_string());
        let (mailbox, _) = self.open_mailbox()?;
        Ok(Self::selected_uids(mailbox, uids)
            .into_iter()
            .map(|uid| {
                let stored = &mailbox.messages[&uid];
                FetchedMessage {
                    uid,
                    flags: stored.flags,
                    raw: stored.raw.clone(),
                    labels: stored.labels.clone(),
                    remote_thread_id: stored.remote_thread_id.clone(),
                }
            })
            .collect())
    }

    async fn fetch_attributes(&mut self, uids: &UidSet) -> HeimdallResult<Vec<UidAttributes>> {
        let (mailbox, _) = self.open_mailbox()?;
        Ok(Self::selected_uids(mailbox, uids)
            .into_iter()
            .map(|uid| UidAttributes { uid, flags: mailbox.messages[&uid].flags })
            .collect())
    }

    async fn search_header(&mut self, header: &str, value: &str) -> HeimdallResult<Vec<u32>> {
        let (mailbox, _) = self.open_mailbox()?;
        let needle = format!("{header}: {value}");
        Ok(mailbox
            .messages
            .iter()
            .filter(|(_, stored)| {
                String::from_utf8_lossy(&stored.raw).contains(&needle)
            })
            .map(|(uid, _)| *uid)
            .collect())
    }

    async fn append(&mut self, container: &str, raw: &[u8]) -> HeimdallResult<()> {
        self.appended.lock().unwrap().push((container.to_string(), raw.to_vec()));
        let mailbox = self
            .mailboxes
            .get_mut(container)
            .ok_or_else(|| HeimdallError::container(format!("unknown container {container}")))?;
        let uid = mailbox.uidnext;
        mailbox.uidnext += 1;
        mailbox.messages.insert(
            uid,
            FakeStoredMessage {
                raw: raw.to_vec(),
                flags: MessageFlags::default(),
                labels: Vec::new(),
                remote_thread_id: None,
            },
        );
        Ok(())
    }

    async fn move_uid(&mut self, uid: u32, target: &str) -> HeimdallResult<()> {
        let (mailbox, _) = self.open_mailbox()?;
        let stored = mailbox
            .messages
            .remove(&uid)
            .ok_or_else(|| HeimdallError::message(format!("unknown uid {uid}")))?;
        let target_mailbox = self
            .mailboxes
            .get_mut(target)
            .ok_or_else(|| HeimdallError::container(format!("unknown container {target}")))?;
        let new_uid = target_mailbox.uidnext;
        target_mailbox.uidnext += 1;
        target_mailbox.messages.insert(new_uid, stored);
        Ok(())
    }

    async fn add_flags(&mut self, uid: u32, flags: &[&str]) -> HeimdallResult<()> {
        let (mailbox, _) = self.open_mailbox()?;
        let stored = mailbox
            .messages
            .get_mut(&uid)
            .ok_or_else(|| HeimdallError::message(format!("unknown uid {uid}")))?;
        for flag in flags {
            match *flag {
                "\\Seen" => stored.flags.unread = false,
                "\\Flagged" => stored.flags.starred = true,
                _ => {}
            }
        }
        Ok(())
    }

    async fn set_labels(&mut self, uid: u32, labels: &[String]) -> HeimdallResult<()> {
        let (mailbox, _) = self.open_mailbox()?;
        let stored = mailbox
            .messages
            .get_mut(&uid)
            .ok_or_else(|| HeimdallError::message(format!("unknown uid {uid}")))?;
        stored.labels = labels.to_vec();
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    async fn close(&mut self) -> HeimdallResult<()> {
        Ok(())
    }
}

/// Hands out pre-built sessions, one per connect
pub struct FakeSessionFactory {
    sessions: Mutex<Vec<FakeSession>>,
}

impl FakeSessionFactory {
    pub fn with_sessions(sessions: Vec<FakeSession>) -> Self {
        let mut sessions = sessions;
        sessions.reverse();
        Self { sessions: Mutex::new(sessions) }
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn connect(&self, _account: &Account) -> HeimdallResult<Box<dyn RemoteSession>> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| HeimdallError::connection("no scripted session left"))?;
        Ok(Box::new(session))
    }
}

/// Records deliveries and fails the scripted recipients
#[derive(Default)]
pub struct FakeTransport {
    failing: HashSet<String>,
    delivered: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeTransport {
    pub fn failing_for(recipients: &[&str]) -> Self {
        Self {
            failing: recipients.iter().map(|r| r.to_string()).collect(),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Successful deliveries, as (recipient, mime)
    pub fn delivered(&self) -> Vec<(String, Vec<u8>)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn send_raw(&self, _from: &str, recipient: &str, mime: &[u8]) -> HeimdallResult<()> {
        if self.failing.contains(recipient) {
            return Err(HeimdallError::connection("scripted delivery failure"));
        }
        self.delivered.lock().unwrap().push((recipient.to_string(), mime.to_vec()));
        Ok(())
    }
}
