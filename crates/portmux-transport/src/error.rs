use crate::traits::PortId;

/// Errors that can occur when posting to a port.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The port (or its peer) has been closed.
    #[error("port {0} is closed")]
    Closed(PortId),

    /// The port refused the message.
    #[error("port {port} rejected message: {reason}")]
    Rejected { port: PortId, reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;
