//! Remote message types
//!
//! Every payload exchanged between host and guest is one variant of
//! [`RemoteMessage`]. Requests from the host, their responses, and the
//! interstitial callbacks a guest may issue mid-call all live in the same
//! union so a receiver can match exhaustively on what arrived.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Addressable unit a caller asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginStrongName {
    pub plugin_id: String,
    pub major_version: u32,
    pub minor_version: u32,
}

impl PluginStrongName {
    pub fn new(plugin_id: impl Into<String>, major_version: u32, minor_version: u32) -> Self {
        Self { plugin_id: plugin_id.into(), major_version, minor_version }
    }
}

impl fmt::Display for PluginStrongName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.plugin_id, self.major_version, self.minor_version)
    }
}

/// Exception raised on the far side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub exception_type: String,
    pub message: String,
}

impl RemoteException {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self { exception_type: exception_type.into(), message: message.into() }
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

/// Return value or exception of a remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult<T> {
    pub return_val: Option<T>,
    pub exception: Option<RemoteException>,
}

impl<T> RemoteResult<T> {
    pub fn ok(value: T) -> Self {
        Self { return_val: Some(value), exception: None }
    }

    pub fn empty() -> Self {
        Self { return_val: None, exception: None }
    }

    pub fn failed(exception: RemoteException) -> Self {
        Self { return_val: None, exception: Some(exception) }
    }

    pub fn into_result(self) -> Result<Option<T>, RemoteException> {
        match self.exception {
            Some(exception) => Err(exception),
            None => Ok(self.return_val),
        }
    }
}

impl<T, E: Into<RemoteException>> From<Result<Option<T>, E>> for RemoteResult<T> {
    fn from(result: Result<Option<T>, E>) -> Self {
        match result {
            Ok(Some(value)) => RemoteResult::ok(value),
            Ok(None) => RemoteResult::empty(),
            Err(e) => RemoteResult::failed(e.into()),
        }
    }
}

// =============================================================================
// HOST -> GUEST REQUESTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRequest {
    pub plugin_id: PluginStrongName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutePluginRequest {
    pub plugin_id: PluginStrongName,
    pub entry_point: Option<String>,
    pub is_retry: bool,
    /// Opaque query body handed to the plugin.
    pub query: Value,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPluginRequest {
    pub plugin_id: PluginStrongName,
    pub query: Value,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossDomainRequestData {
    pub plugin_id: PluginStrongName,
    pub target_intent: String,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossDomainResponseData {
    pub plugin_id: PluginStrongName,
    pub context: Value,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchViewDataRequest {
    pub plugin_id: PluginStrongName,
    pub file_path: String,
    pub if_modified_since: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub sent_ticks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedPluginInfo {
    pub plugin_id: PluginStrongName,
    /// Plugin-defined descriptive data.
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedWebData {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub lifetime_seconds: Option<u64>,
}

// =============================================================================
// GUEST -> HOST INTERSTITIAL REQUESTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub trace_id: Option<String>,
    pub timestamp_ticks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub dimensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePathRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxyRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxyResponseData {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizeSpeechRequest {
    pub text: String,
    pub locale: String,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizeSpeechRequest {
    pub audio: Vec<u8>,
    pub locale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokenRequest {
    pub plugin_id: PluginStrongName,
    pub config_name: String,
    pub user_id: String,
}

// =============================================================================
// THE UNION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteMessage {
    LoadPluginRequest(PluginRequest),
    LoadPluginResponse(RemoteResult<LoadedPluginInfo>),
    UnloadPluginRequest(PluginRequest),
    UnloadPluginResponse(RemoteResult<bool>),
    ExecutePluginRequest(ExecutePluginRequest),
    ExecutePluginResponse(RemoteResult<Value>),
    TriggerPluginRequest(TriggerPluginRequest),
    TriggerPluginResponse(RemoteResult<Value>),
    CrossDomainRequest(CrossDomainRequestData),
    CrossDomainRequestResponse(RemoteResult<Value>),
    CrossDomainResponse(CrossDomainResponseData),
    CrossDomainResponseResponse(RemoteResult<Value>),
    FetchViewDataRequest(FetchViewDataRequest),
    FetchViewDataResponse(RemoteResult<CachedWebData>),
    GetAvailablePluginsRequest,
    GetAvailablePluginsResponse(RemoteResult<Vec<PluginStrongName>>),
    KeepAliveRequest(KeepAliveRequest),
    KeepAliveResponse(RemoteResult<i64>),
    /// Reply to a request the receiver could not even parse.
    Fault(RemoteException),

    Log(LogEvent),
    UploadMetrics(Vec<MetricEvent>),
    FileReadRequest(FilePathRequest),
    FileReadResponse(RemoteResult<Vec<u8>>),
    FileWriteRequest(FileWriteRequest),
    FileWriteResponse(RemoteResult<bool>),
    FileExistsRequest(FilePathRequest),
    FileExistsResponse(RemoteResult<bool>),
    FileListRequest(FilePathRequest),
    FileListResponse(RemoteResult<Vec<String>>),
    HttpProxyRequest(HttpProxyRequest),
    HttpProxyResponse(RemoteResult<HttpProxyResponseData>),
    SynthesizeSpeechRequest(SynthesizeSpeechRequest),
    SynthesizeSpeechResponse(RemoteResult<Vec<u8>>),
    RecognizeSpeechRequest(RecognizeSpeechRequest),
    RecognizeSpeechResponse(RemoteResult<String>),
    OAuthTokenRequest(OAuthTokenRequest),
    OAuthTokenResponse(RemoteResult<String>),
    OAuthDeleteTokenRequest(OAuthTokenRequest),
    OAuthDeleteTokenResponse(RemoteResult<bool>),
}

/// Guest-initiated request kinds a host answers through its handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterstitialKind {
    Log,
    UploadMetrics,
    FileRead,
    FileWrite,
    FileExists,
    FileList,
    HttpProxy,
    SynthesizeSpeech,
    RecognizeSpeech,
    OAuthToken,
    OAuthDeleteToken,
}

impl RemoteMessage {
    /// Variant name, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        use RemoteMessage::*;
        match self {
            LoadPluginRequest(_) => "LoadPluginRequest",
            LoadPluginResponse(_) => "LoadPluginResponse",
            UnloadPluginRequest(_) => "UnloadPluginRequest",
            UnloadPluginResponse(_) => "UnloadPluginResponse",
            ExecutePluginRequest(_) => "ExecutePluginRequest",
            ExecutePluginResponse(_) => "ExecutePluginResponse",
            TriggerPluginRequest(_) => "TriggerPluginRequest",
            TriggerPluginResponse(_) => "TriggerPluginResponse",
            CrossDomainRequest(_) => "CrossDomainRequest",
            CrossDomainRequestResponse(_) => "CrossDomainRequestResponse",
            CrossDomainResponse(_) => "CrossDomainResponse",
            CrossDomainResponseResponse(_) => "CrossDomainResponseResponse",
            FetchViewDataRequest(_) => "FetchViewDataRequest",
            FetchViewDataResponse(_) => "FetchViewDataResponse",
            GetAvailablePluginsRequest => "GetAvailablePluginsRequest",
            GetAvailablePluginsResponse(_) => "GetAvailablePluginsResponse",
            KeepAliveRequest(_) => "KeepAliveRequest",
            KeepAliveResponse(_) => "KeepAliveResponse",
            Fault(_) => "Fault",
            Log(_) => "Log",
            UploadMetrics(_) => "UploadMetrics",
            FileReadRequest(_) => "FileReadRequest",
            FileReadResponse(_) => "FileReadResponse",
            FileWriteRequest(_) => "FileWriteRequest",
            FileWriteResponse(_) => "FileWriteResponse",
            FileExistsRequest(_) => "FileExistsRequest",
            FileExistsResponse(_) => "FileExistsResponse",
            FileListRequest(_) => "FileListRequest",
            FileListResponse(_) => "FileListResponse",
            HttpProxyRequest(_) => "HttpProxyRequest",
            HttpProxyResponse(_) => "HttpProxyResponse",
            SynthesizeSpeechRequest(_) => "SynthesizeSpeechRequest",
            SynthesizeSpeechResponse(_) => "SynthesizeSpeechResponse",
            RecognizeSpeechRequest(_) => "RecognizeSpeechRequest",
            RecognizeSpeechResponse(_) => "RecognizeSpeechResponse",
            OAuthTokenRequest(_) => "OAuthTokenRequest",
            OAuthTokenResponse(_) => "OAuthTokenResponse",
            OAuthDeleteTokenRequest(_) => "OAuthDeleteTokenRequest",
            OAuthDeleteTokenResponse(_) => "OAuthDeleteTokenResponse",
        }
    }

    /// Responses that end a host-initiated call.
    pub fn is_final_response(&self) -> bool {
        use RemoteMessage::*;
        matches!(
            self,
            LoadPluginResponse(_)
                | UnloadPluginResponse(_)
                | ExecutePluginResponse(_)
                | TriggerPluginResponse(_)
                | CrossDomainRequestResponse(_)
                | CrossDomainResponseResponse(_)
                | FetchViewDataResponse(_)
                | GetAvailablePluginsResponse(_)
                | KeepAliveResponse(_)
                | Fault(_)
        )
    }

    pub fn interstitial_kind(&self) -> Option<InterstitialKind> {
        use RemoteMessage::*;
        Some(match self {
            Log(_) => InterstitialKind::Log,
            UploadMetrics(_) => InterstitialKind::UploadMetrics,
            FileReadRequest(_) => InterstitialKind::FileRead,
            FileWriteRequest(_) => InterstitialKind::FileWrite,
            FileExistsRequest(_) => InterstitialKind::FileExists,
            FileListRequest(_) => InterstitialKind::FileList,
            HttpProxyRequest(_) => InterstitialKind::HttpProxy,
            SynthesizeSpeechRequest(_) => InterstitialKind::SynthesizeSpeech,
            RecognizeSpeechRequest(_) => InterstitialKind::RecognizeSpeech,
            OAuthTokenRequest(_) => InterstitialKind::OAuthToken,
            OAuthDeleteTokenRequest(_) => InterstitialKind::OAuthDeleteToken,
            _ => return None,
        })
    }

    /// The failure reply matching this request, or `None` for one-way messages and responses.
    pub fn failure_reply(&self, exception: RemoteException) -> Option<RemoteMessage> {
        use RemoteMessage::*;
        Some(match self {
            LoadPluginRequest(_) => LoadPluginResponse(RemoteResult::failed(exception)),
            UnloadPluginRequest(_) => UnloadPluginResponse(RemoteResult::failed(exception)),
            ExecutePluginRequest(_) => ExecutePluginResponse(RemoteResult::failed(exception)),
            TriggerPluginRequest(_) => TriggerPluginResponse(RemoteResult::failed(exception)),
            CrossDomainRequest(_) => CrossDomainRequestResponse(RemoteResult::failed(exception)),
            CrossDomainResponse(_) => CrossDomainResponseResponse(RemoteResult::failed(exception)),
            FetchViewDataRequest(_) => FetchViewDataResponse(RemoteResult::failed(exception)),
            GetAvailablePluginsRequest => GetAvailablePluginsResponse(RemoteResult::failed(exception)),
            KeepAliveRequest(_) => KeepAliveResponse(RemoteResult::failed(exception)),
            FileReadRequest(_) => FileReadResponse(RemoteResult::failed(exception)),
            FileWriteRequest(_) => FileWriteResponse(RemoteResult::failed(exception)),
            FileExistsRequest(_) => FileExistsResponse(RemoteResult::failed(exception)),
            FileListRequest(_) => FileListResponse(RemoteResult::failed(exception)),
            HttpProxyRequest(_) => HttpProxyResponse(RemoteResult::failed(exception)),
            SynthesizeSpeechRequest(_) => SynthesizeSpeechResponse(RemoteResult::failed(exception)),
            RecognizeSpeechRequest(_) => RecognizeSpeechResponse(RemoteResult::failed(exception)),
            OAuthTokenRequest(_) => OAuthTokenResponse(RemoteResult::failed(exception)),
            OAuthDeleteTokenRequest(_) => OAuthDeleteTokenResponse(RemoteResult::failed(exception)),
            _ => return None,
        })
    }

    /// One-way messages never get a reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, RemoteMessage::Log(_) | RemoteMessage::UploadMetrics(_)) && !self.is_response()
    }

    pub fn is_response(&self) -> bool {
        use RemoteMessage::*;
        self.is_final_response()
            || matches!(
                self,
                FileReadResponse(_)
                    | FileWriteResponse(_)
                    | FileExistsResponse(_)
                    | FileListResponse(_)
                    | HttpProxyResponse(_)
                    | SynthesizeSpeechResponse(_)
                    | RecognizeSpeechResponse(_)
                    | OAuthTokenResponse(_)
                    | OAuthDeleteTokenResponse(_)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> PluginStrongName {
        PluginStrongName::new("weather", 1, 2)
    }

    // TEST080: Strong names display as id:major.minor and order by id first
    #[test]
    fn test_strong_name() {
        assert_eq!(plugin().to_string(), "weather:1.2");
        assert!(PluginStrongName::new("a", 9, 9) < PluginStrongName::new("b", 0, 0));
    }

    // TEST081: Final responses, interstitials and one-way messages are classified apart
    #[test]
    fn test_classification() {
        let load = RemoteMessage::LoadPluginRequest(PluginRequest { plugin_id: plugin() });
        assert!(!load.is_final_response());
        assert!(load.expects_reply());
        assert!(load.interstitial_kind().is_none());

        let resp = RemoteMessage::LoadPluginResponse(RemoteResult::empty());
        assert!(resp.is_final_response());
        assert!(!resp.expects_reply());

        let read = RemoteMessage::FileReadRequest(FilePathRequest { path: "a".into() });
        assert_eq!(read.interstitial_kind(), Some(InterstitialKind::FileRead));
        assert!(read.expects_reply());

        let log = RemoteMessage::Log(LogEvent {
            level: LogLevel::Info,
            component: "c".into(),
            message: "m".into(),
            trace_id: None,
            timestamp_ticks: 0,
        });
        assert_eq!(log.interstitial_kind(), Some(InterstitialKind::Log));
        assert!(!log.expects_reply());
        assert!(log.failure_reply(RemoteException::new("X", "y")).is_none());
    }

    // TEST082: failure_reply picks the response variant paired with the request
    #[test]
    fn test_failure_reply_pairs() {
        let ex = RemoteException::new("PluginNotFound", "nope");
        let reply = RemoteMessage::GetAvailablePluginsRequest.failure_reply(ex.clone()).unwrap();
        assert_eq!(reply, RemoteMessage::GetAvailablePluginsResponse(RemoteResult::failed(ex.clone())));

        let reply = RemoteMessage::OAuthDeleteTokenRequest(OAuthTokenRequest {
            plugin_id: plugin(),
            config_name: "c".into(),
            user_id: "u".into(),
        })
        .failure_reply(ex.clone())
        .unwrap();
        assert!(matches!(reply, RemoteMessage::OAuthDeleteTokenResponse(r) if r.exception.as_ref() == Some(&ex)));
    }

    // TEST083: RemoteResult converts from loader results
    #[test]
    fn test_remote_result_from_result() {
        let ok: RemoteResult<u32> = Ok::<_, RemoteException>(Some(3)).into();
        assert_eq!(ok.into_result(), Ok(Some(3)));
        let empty: RemoteResult<u32> = Ok::<_, RemoteException>(None).into();
        assert_eq!(empty.into_result(), Ok(None));
        let failed: RemoteResult<u32> = Err(RemoteException::new("Boom", "bad")).into();
        assert_eq!(failed.into_result(), Err(RemoteException::new("Boom", "bad")));
    }
}
