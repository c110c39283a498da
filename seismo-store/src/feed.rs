//! The upstream feed driver boundary (§1 Non-goal, Design Note §9): the
//! protocol that delivers raw waveform records is an external collaborator,
//! out of CORE scope. What CORE owns is the capability set a driver must
//! expose and the callback contract the ingest pipeline depends on.

use seismo_common::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// No concrete upstream protocol driver ships with this specification;
    /// callers inject packets directly (tests, replay tools) or a future
    /// driver implements this trait.
    Null,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed driver is not initialized")]
    NotInitialized,
    #[error("feed driver connection failed: {0}")]
    Connect(String),
}

/// Capability set a feed driver exposes to the ingest pipeline (§9
/// "dynamic dispatch over feed drivers"): connect, start/stop streaming, and
/// report status. New protocol drivers implement this trait; no
/// inheritance chain is required.
pub trait FeedDriver: Send {
    fn connect(&mut self) -> Result<(), FeedError>;
    fn start(&mut self, on_packet: Box<dyn FnMut(Packet) + Send>) -> Result<(), FeedError>;
    fn stop(&mut self);
    fn is_connected(&self) -> bool;
    fn is_initialized(&self) -> bool;
    fn kind(&self) -> DriverKind;
}

/// A driver that never produces packets, used by the pipeline's own unit
/// tests as the swappable trait-object boundary in place of a real feed.
#[derive(Default)]
pub struct NullDriver {
    connected: bool,
    callback: Option<Box<dyn FnMut(Packet) + Send>>,
}

impl FeedDriver for NullDriver {
    fn connect(&mut self) -> Result<(), FeedError> {
        self.connected = true;
        Ok(())
    }

    fn start(&mut self, on_packet: Box<dyn FnMut(Packet) + Send>) -> Result<(), FeedError> {
        if !self.connected {
            return Err(FeedError::NotInitialized);
        }
        self.callback = Some(on_packet);
        Ok(())
    }

    fn stop(&mut self) {
        self.callback = None;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_initialized(&self) -> bool {
        self.callback.is_some()
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Null
    }
}
