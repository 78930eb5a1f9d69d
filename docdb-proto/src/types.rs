use std::fmt;

/// Kind of query sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum QueryType {
    /// Start a new query
    Start = 1,
    /// Ask for the next batch of an open stream
    Continue = 2,
    /// Close an open stream
    Stop = 3,
    /// Wait until every noreply query on the connection has been processed
    NoreplyWait = 4,
    /// Ask the server for its identity
    ServerInfo = 5,
}

impl QueryType {
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Whether this query type opens a new token on the connection
    pub fn allocates_token(self) -> bool {
        matches!(
            self,
            QueryType::Start | QueryType::NoreplyWait | QueryType::ServerInfo
        )
    }
}

impl TryFrom<i64> for QueryType {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(QueryType::Start),
            2 => Ok(QueryType::Continue),
            3 => Ok(QueryType::Stop),
            4 => Ok(QueryType::NoreplyWait),
            5 => Ok(QueryType::ServerInfo),
            other => Err(other),
        }
    }
}

/// Kind of response returned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ResponseType {
    SuccessAtom = 1,
    SuccessSequence = 2,
    SuccessPartial = 3,
    WaitComplete = 4,
    ServerInfo = 5,
    ClientError = 16,
    CompileError = 17,
    RuntimeError = 18,
}

impl ResponseType {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

impl TryFrom<i64> for ResponseType {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ResponseType::SuccessAtom),
            2 => Ok(ResponseType::SuccessSequence),
            3 => Ok(ResponseType::SuccessPartial),
            4 => Ok(ResponseType::WaitComplete),
            5 => Ok(ResponseType::ServerInfo),
            16 => Ok(ResponseType::ClientError),
            17 => Ok(ResponseType::CompileError),
            18 => Ok(ResponseType::RuntimeError),
            other => Err(other),
        }
    }
}

/// Annotations attached to a response (`"n"` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ResponseNote {
    SequenceFeed = 1,
    AtomFeed = 2,
    OrderByLimitFeed = 3,
    UnionedFeed = 4,
    IncludesStates = 5,
}

impl ResponseNote {
    pub fn is_feed(self) -> bool {
        !matches!(self, ResponseNote::IncludesStates)
    }
}

impl TryFrom<i64> for ResponseNote {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ResponseNote::SequenceFeed),
            2 => Ok(ResponseNote::AtomFeed),
            3 => Ok(ResponseNote::OrderByLimitFeed),
            4 => Ok(ResponseNote::UnionedFeed),
            5 => Ok(ResponseNote::IncludesStates),
            other => Err(other),
        }
    }
}

/// Sub-classification of runtime errors (`"e"` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Internal,
    ResourceLimit,
    QueryLogic,
    NonExistence,
    OpFailed,
    OpIndeterminate,
    User,
    PermissionError,
    Unknown(i64),
}

impl ErrorType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1_000_000 => ErrorType::Internal,
            2_000_000 => ErrorType::ResourceLimit,
            3_000_000 => ErrorType::QueryLogic,
            3_100_000 => ErrorType::NonExistence,
            4_100_000 => ErrorType::OpFailed,
            4_200_000 => ErrorType::OpIndeterminate,
            5_000_000 => ErrorType::User,
            6_000_000 => ErrorType::PermissionError,
            other => ErrorType::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::Internal => write!(f, "internal"),
            ErrorType::ResourceLimit => write!(f, "resource limit"),
            ErrorType::QueryLogic => write!(f, "query logic"),
            ErrorType::NonExistence => write!(f, "non-existence"),
            ErrorType::OpFailed => write!(f, "op failed"),
            ErrorType::OpIndeterminate => write!(f, "op indeterminate"),
            ErrorType::User => write!(f, "user"),
            ErrorType::PermissionError => write!(f, "permission"),
            ErrorType::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}
