//! Device-side networking for JHCMD cameras.
//!
//! ```text
//!                    ┌──────────────── DeviceEngine ────────────────┐
//!  connect() ──────► │ CommandChannel ──► HANDSHAKE_1/2, START_STREAM│ ──► device:control_port
//!                    │      ▲                                       │
//!                    │      └── keep-alive (START_STREAM / interval)│
//!                    │                                              │
//!  device ─────────► │ data socket ──► FrameAssembler ──► FrameSink │ ──► on_frame / on_error
//!  (UDP fragments)   └──────────────────────────────────────────────┘
//!                                    ▲
//!                    LivenessWatchdog┘ report_stream_lost() → reconnect
//! ```

pub mod channel;
pub mod command;
pub mod engine;
pub mod keepalive;
pub mod liveness;
pub mod reassembler;
pub mod sink;
pub mod stop;

pub use channel::{CommandChannel, CommandTransport, TransportConnector, UdpConnector};
pub use command::Command;
pub use engine::{ConnectOutcome, DeviceEngine};
pub use liveness::{spawn_liveness_watchdog, LivenessWatchdog};
pub use reassembler::{AssemblyEvent, FrameAssembler, PacketHeader};
pub use sink::{FrameSink, NullSink};
pub use stop::StopSignal;
