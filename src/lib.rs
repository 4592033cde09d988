//! # Telecommand Protocol Engine
//!
//! Ground-side engine for commanding a small satellite over an unreliable
//! half-duplex serial link: it discovers the telecommand catalog from
//! firmware source, frames invocations on the wire, and drives automated
//! test procedures against the remote.
//!
//! ## Features
//!
//! - **Catalog extraction**: scan a firmware source tree for telecommand
//!   declarations and build an immutable registry with diagnostics
//! - **Frame codec**: checksummed, length-delimited frames with forward
//!   resynchronization after corruption
//! - **Transport sessions**: synchronous `invoke` with bounded timeouts,
//!   bounded retries, FIFO fairness, and cancellation
//! - **Test orchestration**: ordered procedures with response assertions,
//!   continue/abort policy, and immutable reports
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tcengine::{extract_catalog, ArgValue, CancelToken, SessionConfig, TransportSession};
//!
//! # async fn demo(port: impl tcengine::SerialChannel) -> Result<(), Box<dyn std::error::Error>> {
//! let report = extract_catalog("../firmware".as_ref())?;
//! let session = TransportSession::new(port, Arc::new(report.catalog), SessionConfig::default());
//!
//! let outcome = session
//!     .invoke_by_name("SET_POWER", &[ArgValue::U8(80)], &CancelToken::new())
//!     .await?;
//! println!("SET_POWER -> {outcome:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`catalog`] - firmware source scanning and the telecommand registry
//! - [`command`] - argument values and pre-encode validation
//! - [`codec`] - wire frame encoding/decoding and resynchronization
//! - [`session`] - the half-duplex transport session and channel trait
//! - [`procedure`] - test procedure execution and reporting

#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod catalog;
pub mod codec;
pub mod command;
pub mod procedure;
pub mod session;

// Re-export main public types for convenience
pub use catalog::{
    extract_catalog, Catalog, CatalogError, ExtractionReport, TcmdId, TelecommandDefinition,
};
pub use command::{ArgValue, EncodeError, Invocation};
pub use procedure::{
    run_procedure, AbortPolicy, Expectation, ProcedureReport, StepResult, StepStatus, TcmdRef,
    TestProcedure, TestStep,
};
pub use session::{
    CancelToken, InvokeError, ResponseRecord, SerialChannel, SessionConfig, TransportSession,
};
