//! Core types for upload-queue

use serde::{Deserialize, Serialize};

/// Unique identifier for an upload
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for i64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for TaskId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Upload status
///
/// `Success` and the failure family (`FileNotFound`, `CannotResume`,
/// `UnknownError`) are terminal, as is `Canceled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Queued and waiting to start
    Pending,
    /// An attempt is executing (or was when the process died)
    Running,
    /// Failed transiently, waiting out the backoff delay
    WaitingToRetry,
    /// Waiting for any connectivity
    WaitingForNetwork,
    /// Waiting for a network the upload's policy allows (not roaming, not metered, not blocked)
    WaitingForWifi,
    /// Server accepted the upload
    Success,
    /// Canceled by the user or dropped from the store
    Canceled,
    /// The file reference could not be opened
    FileNotFound,
    /// Retries exhausted or the server refused the request
    CannotResume,
    /// Unclassified failure
    UnknownError,
}

impl Status {
    /// Convert integer status code to Status enum, `None` for unknown codes
    pub fn from_i32(status: i32) -> Option<Self> {
        let status = match status {
            0 => Status::Pending,
            1 => Status::Running,
            2 => Status::WaitingToRetry,
            3 => Status::WaitingForNetwork,
            4 => Status::WaitingForWifi,
            5 => Status::Success,
            6 => Status::Canceled,
            7 => Status::FileNotFound,
            8 => Status::CannotResume,
            9 => Status::UnknownError,
            _ => return None,
        };
        Some(status)
    }

    /// Convert Status enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            Status::Pending => 0,
            Status::Running => 1,
            Status::WaitingToRetry => 2,
            Status::WaitingForNetwork => 3,
            Status::WaitingForWifi => 4,
            Status::Success => 5,
            Status::Canceled => 6,
            Status::FileNotFound => 7,
            Status::CannotResume => 8,
            Status::UnknownError => 9,
        }
    }

    /// No further attempt will be made without an explicit restart
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Success
                | Status::Canceled
                | Status::FileNotFound
                | Status::CannotResume
                | Status::UnknownError
        )
    }

    /// Terminal failure ("Failed" in queries)
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Status::FileNotFound | Status::CannotResume | Status::UnknownError
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How an upload is surfaced to the user
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Shown while running, terminal state not yet surfaced
    #[default]
    Visible,
    /// Shown while running and once more on completion
    VisibleNotifyCompleted,
    /// Completed and dismissed; no longer tracked in memory
    HiddenComplete,
    /// Shown only once it completes
    VisibleNotifyOnlyCompletion,
    /// Never shown
    Hidden,
}

impl Visibility {
    /// Convert integer visibility code to Visibility enum, `None` for unknown codes
    pub fn from_i32(visibility: i32) -> Option<Self> {
        match visibility {
            0 => Some(Visibility::Visible),
            1 => Some(Visibility::VisibleNotifyCompleted),
            2 => Some(Visibility::HiddenComplete),
            3 => Some(Visibility::VisibleNotifyOnlyCompletion),
            5 => Some(Visibility::Hidden),
            _ => None,
        }
    }

    /// Convert Visibility enum to integer visibility code
    pub fn to_i32(&self) -> i32 {
        match self {
            Visibility::Visible => 0,
            Visibility::VisibleNotifyCompleted => 1,
            Visibility::HiddenComplete => 2,
            Visibility::VisibleNotifyOnlyCompletion => 3,
            Visibility::Hidden => 5,
        }
    }
}

/// User control over an upload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    /// Allowed to run
    #[default]
    Run,
    /// Held by the user
    Paused,
}

impl Control {
    /// Convert integer control code to Control enum, `None` for unknown codes
    pub fn from_i32(control: i32) -> Option<Self> {
        match control {
            0 => Some(Control::Run),
            1 => Some(Control::Paused),
            _ => None,
        }
    }

    /// Convert Control enum to integer control code
    pub fn to_i32(&self) -> i32 {
        match self {
            Control::Run => 0,
            Control::Paused => 1,
        }
    }
}

/// Class of the active network link
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// No link
    #[default]
    None,
    /// Wired
    Ethernet,
    /// Wireless LAN
    Wifi,
    /// Mobile data
    Cellular,
    /// Anything else (VPN, tethering, ...)
    Other,
}

/// Snapshot of the active network as reported by a [`Connectivity`](crate::system::Connectivity) facility
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// A link is up
    pub connected: bool,
    /// Link class, used as the retry baseline
    pub kind: NetworkKind,
    /// Link is roaming
    pub roaming: bool,
    /// Link is metered
    pub metered: bool,
    /// Link is up but blocked for background traffic
    pub blocked: bool,
}

impl NetworkInfo {
    /// An unmetered, non-roaming, connected link of the given kind
    pub fn online(kind: NetworkKind) -> Self {
        Self {
            connected: true,
            kind,
            roaming: false,
            metered: false,
            blocked: false,
        }
    }

    /// No link at all
    pub fn offline() -> Self {
        Self::default()
    }
}

/// Whether an upload may use the active network
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    /// Usable
    Ok,
    /// No connectivity at all
    NoConnection,
    /// Link-layer blocked
    Blocked,
    /// Roaming and the upload disallows roaming
    CannotUseRoaming,
    /// Metered and the upload disallows metered links
    CannotUseMetered,
}

impl NetworkState {
    /// Waiting status an upload parks in while this state persists
    pub fn waiting_status(&self) -> Status {
        match self {
            NetworkState::NoConnection => Status::WaitingForNetwork,
            NetworkState::Blocked
            | NetworkState::CannotUseRoaming
            | NetworkState::CannotUseMetered => Status::WaitingForWifi,
            // Only reached on a race where the network recovered mid-check
            NetworkState::Ok => Status::WaitingForNetwork,
        }
    }
}

/// Durable state of one upload
///
/// Owned by the store; the orchestrator and workers hold transient copies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Stable id assigned by the store
    pub id: TaskId,
    /// Endpoint the file is POSTed to
    pub target_url: String,
    /// Locator resolved by the [`FileResolver`](crate::source::FileResolver)
    pub file_reference: String,
    /// Content type of the file part (None = configured default)
    pub mime_type: Option<String>,
    /// Display title
    pub title: Option<String>,
    /// Display description
    pub description: Option<String>,
    /// Per-upload User-Agent override
    pub user_agent: Option<String>,
    /// Multipart field name of the file part (None = configured default)
    pub field_name: Option<String>,
    /// Current status
    pub status: Status,
    /// Consecutive failed attempts
    pub num_failed: u32,
    /// Server-supplied retry delay in seconds (0 = unset)
    pub retry_after_seconds: u32,
    /// Size of the file (-1 = unknown)
    pub total_bytes: i64,
    /// Bytes sent in the current attempt
    pub current_bytes: i64,
    /// Epoch millis of the last persisted change
    pub last_modified_at_millis: i64,
    /// Epoch millis of creation
    pub created_at_millis: i64,
    /// How the upload is surfaced
    pub visibility: Visibility,
    /// Run or paused
    pub control: Control,
    /// May use a roaming link
    pub allow_roaming: bool,
    /// May use a metered link
    pub allow_metered: bool,
    /// Soft-deleted; removed by the next reconciliation pass
    pub deleted: bool,
    /// Response body of a successful upload
    pub server_response: Option<String>,
    /// Message of the last failure
    pub error_message: Option<String>,
    /// Extra request headers, in insertion order
    pub request_headers: Vec<(String, String)>,
    /// Extra multipart text fields, in insertion order
    pub form_fields: Vec<(String, String)>,
}

impl TaskRecord {
    /// Evaluate this upload's network policy against the active network
    pub fn check_network(&self, network: &NetworkInfo) -> NetworkState {
        if !network.connected {
            return NetworkState::NoConnection;
        }
        if network.blocked {
            return NetworkState::Blocked;
        }
        if network.roaming && !self.allow_roaming {
            return NetworkState::CannotUseRoaming;
        }
        if network.metered && !self.allow_metered {
            return NetworkState::CannotUseMetered;
        }
        NetworkState::Ok
    }

    /// Display name: the title if set, otherwise the file reference
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.file_reference)
    }
}

/// What the notifier sees of one upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    /// Upload ID
    pub id: TaskId,
    /// Display name
    pub name: String,
    /// Current status
    pub status: Status,
    /// Bytes sent
    pub current_bytes: i64,
    /// Total bytes (-1 = unknown)
    pub total_bytes: i64,
    /// Consecutive failures
    pub num_failed: u32,
    /// How the upload is surfaced
    pub visibility: Visibility,
    /// Message of the last failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&TaskRecord> for TaskView {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            name: record.display_name().to_string(),
            status: record.status,
            current_bytes: record.current_bytes,
            total_bytes: record.total_bytes,
            num_failed: record.num_failed,
            visibility: record.visibility,
            error_message: record.error_message.clone(),
        }
    }
}

/// Event emitted by the queue
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Full task set after a reconciliation pass
    Snapshot {
        /// Every tracked upload, ordered by id
        tasks: Vec<TaskView>,
    },

    /// Smoothed transfer rate of a running upload
    Rate {
        /// Upload ID
        id: TaskId,
        /// Bytes per second (0 once the attempt ends)
        bytes_per_second: u64,
    },

    /// A worker attempt ended, whatever the outcome
    AttemptFinished {
        /// Upload ID
        id: TaskId,
        /// Status written by the attempt
        status: Status,
        /// Failure counter after the attempt
        num_failed: u32,
    },

    /// An upload reached a terminal status
    Completed {
        /// Upload ID
        id: TaskId,
        /// Terminal status
        status: Status,
    },

    /// Queue is shutting down
    Shutdown,
}

/// A new upload to enqueue
///
/// Built with [`NewUpload::new`] and the chained setters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewUpload {
    /// Endpoint the file is POSTed to
    pub target_url: String,
    /// Locator of the file to send
    pub file_reference: String,
    /// Content type of the file part
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
    /// Display description
    #[serde(default)]
    pub description: Option<String>,
    /// User-Agent override
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Multipart field name of the file part
    #[serde(default)]
    pub field_name: Option<String>,
    /// How the upload is surfaced
    #[serde(default)]
    pub visibility: Visibility,
    /// May use a roaming link (default: true)
    #[serde(default = "default_true")]
    pub allow_roaming: bool,
    /// May use a metered link (default: true)
    #[serde(default = "default_true")]
    pub allow_metered: bool,
    /// Extra request headers
    #[serde(default)]
    pub request_headers: Vec<(String, String)>,
    /// Extra multipart text fields
    #[serde(default)]
    pub form_fields: Vec<(String, String)>,
}

fn default_true() -> bool {
    true
}

impl NewUpload {
    /// Upload `file_reference` to `target_url` with default policy
    pub fn new(target_url: impl Into<String>, file_reference: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            file_reference: file_reference.into(),
            mime_type: None,
            title: None,
            description: None,
            user_agent: None,
            field_name: None,
            visibility: Visibility::default(),
            allow_roaming: true,
            allow_metered: true,
            request_headers: Vec::new(),
            form_fields: Vec::new(),
        }
    }

    /// Set the content type of the file part
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the display title
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the display description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Override the User-Agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the multipart field name of the file part
    pub fn field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    /// Set the visibility policy
    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Allow or forbid roaming links
    pub fn allow_roaming(mut self, allow: bool) -> Self {
        self.allow_roaming = allow;
        self
    }

    /// Allow or forbid metered links
    pub fn allow_metered(mut self, allow: bool) -> Self {
        self.allow_metered = allow;
        self
    }

    /// Append a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    /// Append a multipart text field
    pub fn form_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form_fields.push((name.into(), value.into()));
        self
    }
}

/// Sort key for [`TaskQuery`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    /// Last persisted change
    #[default]
    LastModified,
    /// File size
    TotalBytes,
}

/// Sort direction for [`TaskQuery`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first
    Ascending,
    /// Largest first
    #[default]
    Descending,
}

/// Filter and order for listing uploads
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQuery {
    /// Restrict to these ids (None = all)
    #[serde(default)]
    pub ids: Option<Vec<TaskId>>,
    /// Restrict to these statuses (None = all)
    #[serde(default)]
    pub statuses: Option<Vec<Status>>,
    /// Sort key
    #[serde(default)]
    pub order_by: OrderBy,
    /// Sort direction
    #[serde(default)]
    pub direction: Direction,
    /// Include soft-deleted records
    #[serde(default)]
    pub include_deleted: bool,
}

impl TaskQuery {
    /// Every non-deleted upload, most recently changed first
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given ids
    pub fn with_ids(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Restrict to the given statuses
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Terminal failures only
    pub fn failed() -> Self {
        Self::default().with_statuses([
            Status::FileNotFound,
            Status::CannotResume,
            Status::UnknownError,
        ])
    }

    /// Set the sort order
    pub fn order(mut self, order_by: OrderBy, direction: Direction) -> Self {
        self.order_by = order_by;
        self.direction = direction;
        self
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord {
            id: TaskId(1),
            target_url: "https://example.com/upload".to_string(),
            file_reference: "/tmp/a.bin".to_string(),
            mime_type: None,
            title: None,
            description: None,
            user_agent: None,
            field_name: None,
            status: Status::Pending,
            num_failed: 0,
            retry_after_seconds: 0,
            total_bytes: -1,
            current_bytes: 0,
            last_modified_at_millis: 0,
            created_at_millis: 0,
            visibility: Visibility::Visible,
            control: Control::Run,
            allow_roaming: true,
            allow_metered: true,
            deleted: false,
            server_response: None,
            error_message: None,
            request_headers: Vec::new(),
            form_fields: Vec::new(),
        }
    }

    #[test]
    fn status_codes_are_stable() {
        for code in 0..=9 {
            assert_eq!(Status::from_i32(code).unwrap().to_i32(), code);
        }
        assert_eq!(Status::from_i32(42), None);
        assert_eq!(Status::from_i32(-1), None);
    }

    #[test]
    fn status_families() {
        assert!(Status::Success.is_terminal());
        assert!(!Status::Success.is_failed());
        assert!(Status::CannotResume.is_failed());
        assert!(Status::Canceled.is_terminal());
        assert!(!Status::Canceled.is_failed());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn visibility_codes_skip_four() {
        assert_eq!(Visibility::Hidden.to_i32(), 5);
        assert_eq!(Visibility::from_i32(5), Some(Visibility::Hidden));
        assert_eq!(Visibility::from_i32(4), None);
        assert_eq!(Control::from_i32(1), Some(Control::Paused));
        assert_eq!(Control::from_i32(2), None);
    }

    #[test]
    fn roaming_is_refused_only_when_disallowed() {
        let mut task = record();
        let roaming = NetworkInfo {
            roaming: true,
            ..NetworkInfo::online(NetworkKind::Cellular)
        };
        assert_eq!(task.check_network(&roaming), NetworkState::Ok);

        task.allow_roaming = false;
        assert_eq!(task.check_network(&roaming), NetworkState::CannotUseRoaming);
        assert_eq!(
            NetworkState::CannotUseRoaming.waiting_status(),
            Status::WaitingForWifi
        );
    }

    #[test]
    fn no_connection_waits_for_network() {
        let task = record();
        let state = task.check_network(&NetworkInfo::offline());
        assert_eq!(state, NetworkState::NoConnection);
        assert_eq!(state.waiting_status(), Status::WaitingForNetwork);
    }

    #[test]
    fn blocked_wins_over_metered() {
        let mut task = record();
        task.allow_metered = false;
        let net = NetworkInfo {
            blocked: true,
            metered: true,
            ..NetworkInfo::online(NetworkKind::Wifi)
        };
        assert_eq!(task.check_network(&net), NetworkState::Blocked);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::Completed {
            id: TaskId(3),
            status: Status::Success,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "completed");
        assert_eq!(json["id"], 3);
        assert_eq!(json["status"], "success");
    }
}
