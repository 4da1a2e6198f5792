pub mod protocol;
pub mod models;

pub use protocol::{
    InboundFrame, OutboundFrame, ProtocolError,
    parse_frame, CHAT_PATH_PREFIX,
};

pub use models::{
    CloseInfo, ConnectionInfo, ConnectionState,
    CLOSE_ABNORMAL, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NO_STATUS, CLOSE_NORMAL,
};
