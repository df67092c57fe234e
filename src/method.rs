//! The fixed method set served by the coordinator.
//!
//! Method IDs are assigned statically (1..=6); 0 is reserved and `0xFFFF`
//! is the ABORT signal, see [`crate::protocol::ABORT_METHOD_ID`].

use std::fmt;

/// One of the six RPC operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    CreateSession,
    ExtendSession,
    RunStep,
    CloseSession,
    ListDevices,
    Reset,
}

impl Method {
    /// Number of methods.
    pub const COUNT: usize = 6;

    /// All methods in id order.
    pub const ALL: [Method; Method::COUNT] = [
        Method::CreateSession,
        Method::ExtendSession,
        Method::RunStep,
        Method::CloseSession,
        Method::ListDevices,
        Method::Reset,
    ];

    /// Wire id of this method.
    #[inline]
    pub fn id(self) -> u16 {
        self.index() as u16 + 1
    }

    /// Dense index into per-method tables.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Method::CreateSession => 0,
            Method::ExtendSession => 1,
            Method::RunStep => 2,
            Method::CloseSession => 3,
            Method::ListDevices => 4,
            Method::Reset => 5,
        }
    }

    /// Look a method up by wire id.
    pub fn from_id(id: u16) -> Option<Method> {
        match id {
            1..=6 => Some(Method::ALL[id as usize - 1]),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::CreateSession => "CreateSession",
            Method::ExtendSession => "ExtendSession",
            Method::RunStep => "RunStep",
            Method::CloseSession => "CloseSession",
            Method::ListDevices => "ListDevices",
            Method::Reset => "Reset",
        }
    }

    /// Whether a client cancel reaches the service for this method.
    ///
    /// Only RunStep is long-running enough to be worth interrupting.
    #[inline]
    pub fn is_cancellable(self) -> bool {
        matches!(self, Method::RunStep)
    }

    /// Standing slot count used when nothing is configured.
    pub fn default_standing(self) -> usize {
        match self {
            Method::RunStep => 100,
            _ => 1,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
