use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterErrorCode {
    Conflict,
    Store,
    Scheduler,
    InvalidConfig,
    InvalidKey,
    Overflow,
    Encode,
    Decode,
}

impl CounterErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterErrorCode::Conflict => "conflict",
            CounterErrorCode::Store => "store",
            CounterErrorCode::Scheduler => "scheduler",
            CounterErrorCode::InvalidConfig => "invalid_config",
            CounterErrorCode::InvalidKey => "invalid_key",
            CounterErrorCode::Overflow => "overflow",
            CounterErrorCode::Encode => "encode",
            CounterErrorCode::Decode => "decode",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CounterError {
    /// Another transaction committed over data this one read. The only error
    /// class the transaction runner retries.
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("store error: {message}")]
    Store { message: String },
    #[error("scheduler error: {message}")]
    Scheduler { message: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("counter overflow on property '{property}'")]
    Overflow { property: String },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl CounterError {
    pub fn store(message: impl Into<String>) -> Self {
        CounterError::Store {
            message: message.into(),
        }
    }

    pub fn scheduler(message: impl Into<String>) -> Self {
        CounterError::Scheduler {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        CounterError::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CounterError::Conflict(_))
    }

    pub fn code(&self) -> CounterErrorCode {
        match self {
            CounterError::Conflict(_) => CounterErrorCode::Conflict,
            CounterError::Store { .. } => CounterErrorCode::Store,
            CounterError::Scheduler { .. } => CounterErrorCode::Scheduler,
            CounterError::InvalidConfig { .. } => CounterErrorCode::InvalidConfig,
            CounterError::InvalidKey(_) => CounterErrorCode::InvalidKey,
            CounterError::Overflow { .. } => CounterErrorCode::Overflow,
            CounterError::Encode(_) => CounterErrorCode::Encode,
            CounterError::Decode(_) => CounterErrorCode::Decode,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}
