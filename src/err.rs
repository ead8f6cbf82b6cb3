use crate::State;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid socket descriptor: {0}")]
    BadDescriptor(usize),

    #[error("{call} is not valid in state {state}")]
    WrongState { call: &'static str, state: State },

    #[error("descriptor table is full")]
    OutOfSlots,

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("malformed PDU")]
    MalformedPdu,

    #[error("connection reset by peer")]
    PeerReset,

    #[error("no acknowledgement after retransmission limit")]
    TimedOut,
}
