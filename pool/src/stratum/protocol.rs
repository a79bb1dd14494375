/// Stratum v1 message types and parameter parsing
///
/// Every line on the wire is one of:
/// - a request `{"id", "method", "params"}` (miner -> pool)
/// - a response `{"id", "result", "error"}` correlated to a request id
/// - a notification `{"id": null, "method", "params"}` pushed by the pool

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed back verbatim
    #[serde(default)]
    pub id: Value,

    pub method: String,

    /// Positional parameters (some miners omit them)
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self { id: id.into(), method: method.to_string(), params }
    }

    fn param(&self, index: usize) -> Option<&Value> {
        self.params.as_array().and_then(|p| p.get(index))
    }

    fn str_param(&self, index: usize) -> Option<&str> {
        self.param(index).and_then(|v| v.as_str())
    }

    fn required_str(&self, index: usize, name: &str) -> Result<String, StratumError> {
        self.str_param(index)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StratumError::invalid_params(format!("Missing {}", name)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Option<StratumError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self { id, result, error: None }
    }

    pub fn error(id: Value, error: StratumError) -> Self {
        Self { id, result: Value::Null, error: Some(error) }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Server-initiated push. `id` is always null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

impl Notification {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self { id: Value::Null, method: method.to_string(), params }
    }

    /// `mining.set_difficulty`; whole difficulties are sent as integers.
    pub fn set_difficulty(difficulty: f64) -> Self {
        let value = if difficulty.fract() == 0.0 && difficulty >= 1.0 && difficulty < u64::MAX as f64 {
            json!(difficulty as u64)
        } else {
            json!(difficulty)
        };
        Self::new(Method::SetDifficulty.as_str(), vec![value])
    }
}

/// Anything the pool writes to a miner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(r) => Some(r),
            Message::Notification(_) => None,
        }
    }

    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Message::Notification(n) => Some(n),
            Message::Response(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.as_notification().map(|n| n.method.as_str())
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

/// Stratum error, encoded on the wire as `[code, message, null]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub const OTHER: i32 = 20;
    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::OTHER, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("Unknown method: {}", method))
    }

    pub fn job_not_found() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "Job not found")
    }

    pub fn duplicate_share() -> Self {
        Self::new(Self::DUPLICATE_SHARE, "Duplicate share")
    }

    pub fn low_difficulty() -> Self {
        Self::new(Self::LOW_DIFFICULTY, "Low difficulty share")
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "Unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(Self::NOT_SUBSCRIBED, "Not subscribed")
    }
}

impl Serialize for StratumError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.code, &self.message, Value::Null).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StratumError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Triple(i32, String, Value),
            Object { code: i32, message: String },
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Triple(code, message, _) => StratumError { code, message },
            Wire::Object { code, message } => StratumError { code, message },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Configure,
    Subscribe,
    Authorize,
    Submit,
    ExtranonceSubscribe,
    SuggestDifficulty,
    SetDifficulty,
    Notify,
    Unknown(String),
}

impl Method {
    pub fn parse(method: &str) -> Self {
        match method {
            "mining.configure" => Method::Configure,
            "mining.subscribe" => Method::Subscribe,
            "mining.authorize" => Method::Authorize,
            "mining.submit" => Method::Submit,
            "mining.extranonce.subscribe" => Method::ExtranonceSubscribe,
            "mining.suggest_difficulty" => Method::SuggestDifficulty,
            "mining.set_difficulty" => Method::SetDifficulty,
            "mining.notify" => Method::Notify,
            other => Method::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Configure => "mining.configure",
            Method::Subscribe => "mining.subscribe",
            Method::Authorize => "mining.authorize",
            Method::Submit => "mining.submit",
            Method::ExtranonceSubscribe => "mining.extranonce.subscribe",
            Method::SuggestDifficulty => "mining.suggest_difficulty",
            Method::SetDifficulty => "mining.set_difficulty",
            Method::Notify => "mining.notify",
            Method::Unknown(m) => m,
        }
    }
}

/// `mining.configure` params: `[["version-rolling", ...], {"version-rolling.mask": "..."}]`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureParams {
    pub extensions: Vec<String>,
    pub version_rolling_mask: Option<u32>,
    pub version_rolling_min_bit_count: Option<u32>,
}

impl TryFrom<&Request> for ConfigureParams {
    type Error = StratumError;

    fn try_from(req: &Request) -> Result<Self, Self::Error> {
        let extensions = match req.param(0) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            Some(_) => return Err(StratumError::invalid_params("Extensions must be a list")),
        };

        let options = req.param(1).and_then(|v| v.as_object());
        let version_rolling_mask = match options.and_then(|o| o.get("version-rolling.mask")) {
            None => None,
            Some(v) => {
                let s = v
                    .as_str()
                    .ok_or_else(|| StratumError::invalid_params("version-rolling.mask must be hex"))?;
                Some(
                    crate::config::parse_mask(s)
                        .map_err(|_| StratumError::invalid_params("version-rolling.mask must be hex"))?,
                )
            }
        };
        let version_rolling_min_bit_count = options
            .and_then(|o| o.get("version-rolling.min-bit-count"))
            .and_then(|v| v.as_u64())
            .map(|n| n as u32);

        Ok(Self { extensions, version_rolling_mask, version_rolling_min_bit_count })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeParams {
    pub user_agent: Option<String>,
}

impl TryFrom<&Request> for SubscribeParams {
    type Error = StratumError;

    fn try_from(req: &Request) -> Result<Self, Self::Error> {
        Ok(Self { user_agent: req.str_param(0).map(|s| s.to_string()) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeParams {
    /// Opaque; usually `wallet.worker`
    pub worker_name: String,
    pub password: Option<String>,
}

impl TryFrom<&Request> for AuthorizeParams {
    type Error = StratumError;

    fn try_from(req: &Request) -> Result<Self, Self::Error> {
        let worker_name = req.required_str(0, "worker name")?;
        let password = req.str_param(1).map(|s| s.to_string());
        Ok(Self { worker_name, password })
    }
}

/// `mining.submit` params: `[worker, job_id, extranonce2, ntime, nonce, (version_bits)]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub worker_name: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub version_bits: Option<String>,
}

impl TryFrom<&Request> for SubmitParams {
    type Error = StratumError;

    fn try_from(req: &Request) -> Result<Self, Self::Error> {
        Ok(Self {
            worker_name: req.required_str(0, "worker name")?,
            job_id: req.required_str(1, "job id")?,
            extranonce2: req.required_str(2, "extranonce2")?,
            ntime: req.required_str(3, "ntime")?,
            nonce: req.required_str(4, "nonce")?,
            version_bits: req.str_param(5).map(|s| s.trim().to_string()),
        })
    }
}
