//! The protocol seam
//!
//! [`RemoteSession`] is the narrow interface the sync engine drives a remote
//! mailbox through. The production implementation speaks IMAP; tests script
//! a fake. All higher layers branch on [`Capabilities`] instead of sniffing
//! the provider.

use async_trait::async_trait;

use crate::error::HeimdallResult;
use crate::message::MessageFlags;

/// Optional protocol behaviors negotiated at connect time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Per-message labels (label-based mailbox model)
    pub labels: bool,
    /// Change-tracking (CONDSTORE)
    pub condstore: bool,
    /// Extended search
    pub esearch: bool,
    /// Quota reporting
    pub quota: bool,
    /// Server push while idle
    pub idle: bool,
}

/// A set of UIDs addressed by one protocol call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidSet {
    /// `start:*`
    RangeFrom(u32),
    /// `start:end`
    Range(u32, u32),
    /// An explicit list
    List(Vec<u32>),
}

impl UidSet {
    pub fn is_empty(&self) -> bool {
        matches!(self, UidSet::List(uids) if uids.is_empty())
    }
}

impl std::fmt::Display for UidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UidSet::RangeFrom(start) => write!(f, "{start}:*"),
            UidSet::Range(start, end) => write!(f, "{start}:{end}"),
            UidSet::List(uids) => {
                let joined = uids
                    .iter()
                    .map(|u| u.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "{joined}")
            }
        }
    }
}

/// What the server reports when a container is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Next UID the server will assign
    pub uidnext: u32,
    /// Current UID epoch
    pub uidvalidity: u32,
    /// Number of messages in the container
    pub exists: u32,
}

/// One entry from container-list discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContainerInfo {
    pub name: String,
    /// Raw name attributes, e.g. `\Sent`, `\Noselect`
    pub attributes: Vec<String>,
}

impl RemoteContainerInfo {
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|a| a.contains("Noselect"))
    }
}

/// A full message fetch: everything the processing pipeline needs
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: MessageFlags,
    /// Raw RFC 2822 bytes
    pub raw: Vec<u8>,
    /// Per-message labels, when the session has the `labels` capability
    pub labels: Vec<String>,
    /// Provider-native conversation id, when the server supplies one
    pub remote_thread_id: Option<String>,
}

/// A lightweight attribute fetch: flags only, no body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidAttributes {
    pub uid: u32,
    pub flags: MessageFlags,
}

/// Session-level events the server pushes outside of any operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// New mail arrived in the open container
    NewMail,
    /// Message metadata (flags) changed externally
    FlagsChanged,
    /// The UID epoch of the open container changed mid-session
    UidValidityChanged,
}

/// One stateful protocol session. Not reentrant: the connection actor is the
/// only caller, one operation at a time.
#[async_trait]
pub trait RemoteSession: Send {
    /// Optional behaviors recorded at connect time
    fn capabilities(&self) -> Capabilities;

    /// List every container on the server
    async fn list_containers(&mut self) -> HeimdallResult<Vec<RemoteContainerInfo>>;

    /// Open a container; subsequent UID calls address it
    async fn open_container(&mut self, name: &str) -> HeimdallResult<ContainerStatus>;

    /// Fetch full messages for the given UID set in the open container
    async fn fetch_full(&mut self, uids: &UidSet) -> HeimdallResult<Vec<FetchedMessage>>;

    /// Fetch flags only for the given UID set in the open container
    async fn fetch_attributes(&mut self, uids: &UidSet) -> HeimdallResult<Vec<UidAttributes>>;

    /// Search the open container for messages carrying a header value
    async fn search_header(&mut self, header: &str, value: &str) -> HeimdallResult<Vec<u32>>;

    /// Append raw RFC 2822 content to a container
    async fn append(&mut self, container: &str, raw: &[u8]) -> HeimdallResult<()>;

    /// Move a message out of the open container
    async fn move_uid(&mut self, uid: u32, target: &str) -> HeimdallResult<()>;

    /// Add flags to a message in the open container
    async fn add_flags(&mut self, uid: u32, flags: &[&str]) -> HeimdallResult<()>;

    /// Replace the label set of a message in the open container.
    /// Only meaningful when `capabilities().labels` is set.
    async fn set_labels(&mut self, uid: u32, labels: &[String]) -> HeimdallResult<()>;

    /// Drain any events the server pushed since the last call
    fn poll_events(&mut self) -> Vec<SessionEvent>;

    /// Close the session. Best effort; errors are the caller's to log.
    async fn close(&mut self) -> HeimdallResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_set_display() {
        assert_eq!(UidSet::RangeFrom(100).to_string(), "100:*");
        assert_eq!(UidSet::Range(1, 50).to_string(), "1:50");
        assert_eq!(UidSet::List(vec![3, 7, 9]).to_string(), "3,7,9");
    }

    #[test]
    fn test_empty_uid_set() {
        assert!(UidSet::List(vec![]).is_empty());
        assert!(!UidSet::RangeFrom(1).is_empty());
    }

    #[test]
    fn test_noselect_detection() {
        let info = RemoteContainerInfo {
            name: "[Gmail]".to_string(),
            attributes: vec!["Noselect".to_string()],
        };
        assert!(!info.is_selectable());
    }
}
