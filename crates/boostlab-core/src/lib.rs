//! # BoostLab Core Library
//!
//! Core functionality for the BoostLab diagnostics and tuning suite for
//! turbocharged direct-injection ECUs.

#![warn(missing_docs)]

//!
//! This library provides:
//! - Serial link transport with framing, checksums, and reconnect
//! - Request/reply protocol codec driven by a parameter table
//! - Periodic telemetry sampling into retained snapshot history
//! - Versioned tuning maps with safety-envelope-gated writes
//! - Telemetry-driven tuning recommendations
//! - A virtual dyno estimating torque, power, 0-60, and quarter mile
//! - A demo ECU simulator for hardware-free operation
//!
//! ## Example
//!
//! ```rust,ignore
//! use boostlab_core::prelude::*;
//! use std::sync::Arc;
//!
//! // Run the whole stack against the built-in simulator
//! let link = Link::from_channel(Box::new(DemoEcu::new(42)), LinkConfig::default());
//! let table = Arc::new(ParameterTable::builtin());
//! let channel = EcuChannel::spawn(link, Arc::clone(&table));
//!
//! let mut sampler = Sampler::new(
//!     Box::new(channel.handle()),
//!     table,
//!     SamplerConfig::default(),
//! );
//! let snapshot = sampler.cycle();
//! println!("RPM: {:?}", snapshot.value("rpm"));
//! ```

pub mod cancel;
pub mod demo;
pub mod dtc;
pub mod dyno;
pub mod maps;
pub mod params;
pub mod protocol;
pub mod recommend;
pub mod telemetry;
pub mod unit_conversion;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::demo::DemoEcu;
    pub use crate::dyno::{simulate, DynoResult, DynoRun, VehicleParams};
    pub use crate::maps::{MapId, MapStore, SafetyEnvelope, TuningMap, WriteTransaction};
    pub use crate::params::{ParameterDef, ParameterTable, Pid};
    pub use crate::protocol::{
        EcuChannel, EcuHandle, Link, LinkConfig, LinkState, Message, Priority, ProtocolError,
        Request,
    };
    pub use crate::recommend::{
        Candidate, ConfidencePolicy, KnockBiasScorer, RecommendationEngine,
    };
    pub use crate::telemetry::{Sampler, SamplerConfig, Snapshot, TelemetryHistory, Validity};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
