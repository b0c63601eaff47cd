use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Node name used when a caller does not address a specific node.
pub const DEFAULT_NODE: &str = "__localhost__";

/// Method every initiating side calls first to announce its identity.
pub const HANDSHAKE_METHOD: &str = "connect";

pub const METHOD_NOT_FOUND: &str = "MethodNotFound";
pub const INVALID_ARGUMENTS: &str = "InvalidArguments";
pub const HANDLER_ERROR: &str = "HandlerError";
pub const PANIC: &str = "Panic";
/// Sent in place of a result whose encoding exceeds the frame limit.
pub const RESPONSE_TOO_LARGE: &str = "ResponseTooLarge";

/// Token linking a request to its response.
///
/// Ids are only meaningful to the side that issued them; the peer echoes them
/// back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Addressing information carried by a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub node: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub instance: Option<i64>,
}

impl Target {
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            node: DEFAULT_NODE.to_string(),
            service: Some(service.into()),
            instance: None,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_instance(mut self, instance: i64) -> Self {
        self.instance = Some(instance);
        self
    }
}

impl Default for Target {
    fn default() -> Self {
        Self {
            node: DEFAULT_NODE.to_string(),
            service: None,
            instance: None,
        }
    }
}

/// One discrete protocol message.
///
/// The `type` field is the only thing used to tell requests from responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Request(_) => "request",
            Frame::Response(_) => "response",
        }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

impl From<Request> for Frame {
    fn from(req: Request) -> Self {
        Frame::Request(req)
    }
}

impl From<Response> for Frame {
    fn from(resp: Response) -> Self {
        Frame::Response(resp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Absent for fire-and-forget requests; the peer must not answer those.
    #[serde(default)]
    pub id: Option<CorrelationId>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            target: None,
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            id: None,
        }
    }

    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    #[serde(default)]
    pub error: Option<RemoteError>,
    #[serde(default)]
    pub result: Value,
}

impl Response {
    pub fn success(id: CorrelationId, result: impl Into<Value>) -> Self {
        Self {
            id,
            error: None,
            result: result.into(),
        }
    }

    pub fn failure(id: CorrelationId, error: RemoteError) -> Self {
        Self {
            id,
            error: Some(error),
            result: Value::Null,
        }
    }

    pub fn from_outcome(id: CorrelationId, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(id, err),
        }
    }

    /// Error wins over result when both are present.
    pub fn into_outcome(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

/// Structured failure record sent back in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unknown method: {}", method))
    }

    pub fn invalid_arguments(method: &str, err: impl fmt::Display) -> Self {
        Self::new(
            INVALID_ARGUMENTS,
            format!("Invalid arguments for {}: {}", method, err),
        )
    }
}

/// Identity announced in the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub service: String,
    #[serde(default)]
    pub instance: Option<i64>,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Identity {
    pub fn new(service: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Builds the fire-and-forget `connect` request.
    pub fn handshake_request(&self) -> Request {
        let mut req = Request::new(HANDSHAKE_METHOD);
        req.kwargs
            .insert("service".into(), Value::String(self.service.clone()));
        req.kwargs.insert(
            "instance".into(),
            self.instance.map(Value::from).unwrap_or(Value::Null),
        );
        req.kwargs
            .insert("token".into(), Value::String(self.token.clone()));
        req.kwargs
            .insert("params".into(), Value::Object(self.params.clone()));
        req
    }

    /// Inverse of [`Identity::handshake_request`], for the accepting side.
    pub fn from_handshake(kwargs: &Map<String, Value>) -> Option<Self> {
        let service = kwargs.get("service")?.as_str()?.to_string();
        Some(Self {
            service,
            instance: kwargs.get("instance").and_then(Value::as_i64),
            token: kwargs
                .get("token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            params: kwargs
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }
}
