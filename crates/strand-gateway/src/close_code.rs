/// Close codes the gateway documents, with whether a reconnect may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    GracefulClose,
    GoingAway,
    Abnormal,
    UnknownError,
    UnknownOpcode,
    DecodeError,
    NotAuthenticated,
    AuthenticationFailed,
    AlreadyAuthenticated,
    InvalidSequence,
    RateLimited,
    SessionTimeout,
    InvalidShard,
    ShardingRequired,
    Unknown(u16),
}

impl CloseCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => CloseCode::GracefulClose,
            1001 => CloseCode::GoingAway,
            1006 => CloseCode::Abnormal,
            4000 => CloseCode::UnknownError,
            4001 => CloseCode::UnknownOpcode,
            4002 => CloseCode::DecodeError,
            4003 => CloseCode::NotAuthenticated,
            4004 => CloseCode::AuthenticationFailed,
            4005 => CloseCode::AlreadyAuthenticated,
            4007 => CloseCode::InvalidSequence,
            4008 => CloseCode::RateLimited,
            4009 => CloseCode::SessionTimeout,
            4010 => CloseCode::InvalidShard,
            4011 => CloseCode::ShardingRequired,
            other => CloseCode::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            CloseCode::GracefulClose => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Abnormal => 1006,
            CloseCode::UnknownError => 4000,
            CloseCode::UnknownOpcode => 4001,
            CloseCode::DecodeError => 4002,
            CloseCode::NotAuthenticated => 4003,
            CloseCode::AuthenticationFailed => 4004,
            CloseCode::AlreadyAuthenticated => 4005,
            CloseCode::InvalidSequence => 4007,
            CloseCode::RateLimited => 4008,
            CloseCode::SessionTimeout => 4009,
            CloseCode::InvalidShard => 4010,
            CloseCode::ShardingRequired => 4011,
            CloseCode::Unknown(other) => other,
        }
    }

    /// Unknown codes are treated as recoverable.
    pub fn is_reconnectable(self) -> bool {
        !matches!(
            self,
            CloseCode::AuthenticationFailed | CloseCode::InvalidShard | CloseCode::ShardingRequired
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            CloseCode::GracefulClose => "graceful close",
            CloseCode::GoingAway => "server going away",
            CloseCode::Abnormal => "connection dropped",
            CloseCode::UnknownError => "unknown error",
            CloseCode::UnknownOpcode => "unknown opcode sent",
            CloseCode::DecodeError => "invalid payload sent",
            CloseCode::NotAuthenticated => "payload sent before identify",
            CloseCode::AuthenticationFailed => "authentication failed",
            CloseCode::AlreadyAuthenticated => "identify sent twice",
            CloseCode::InvalidSequence => "invalid resume sequence",
            CloseCode::RateLimited => "rate limited",
            CloseCode::SessionTimeout => "session timed out",
            CloseCode::InvalidShard => "invalid shard",
            CloseCode::ShardingRequired => "sharding required",
            CloseCode::Unknown(_) => "unrecognized close code",
        }
    }
}

/// Local close codes used when the client itself drops the connection.
pub(crate) const CLOSE_NORMAL: u16 = 1000;
pub(crate) const CLOSE_RECONNECT: u16 = 4000;
