pub mod config;
pub mod counter;
pub mod device;
pub mod error;
pub mod network;
pub mod nvram;
pub mod reset;
pub mod retry;
pub mod session;
pub mod signal;
pub mod store;
pub mod telemetry;
pub mod topics;

#[cfg(test)]
mod fakes;

pub use config::{
    AccessPointIdentity, DocumentKind, MessagingProfile, NetworkProfile, SupervisorConfig,
};
pub use counter::{CounterLayout, CounterStore};
pub use device::{Device, Platform, Signals};
pub use error::{DeviceError, LinkError, NvramError, SessionError, StoreError};
pub use network::{BootOutcome, LinkState, NetworkManager, NetworkStatus, StaticAddressing, WifiLink};
pub use nvram::{ByteStore, FileByteStore, NvBytes, NVRAM_CAPACITY};
pub use retry::{Clock, Restart, SystemClock};
pub use session::{BrokerSession, InboundMessage, SessionOptions};
pub use store::{ConfigStore, DocumentStorage, FsDocumentStorage};
pub use telemetry::{DigitalInput, SensorBank, StatusReport, TelemetrySnapshot, DISCONNECTED_CELSIUS};
pub use topics::TopicSet;
