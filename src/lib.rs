//! # fanwall - Modbus control stack for wind-tunnel fan walls
//!
//! Drives a wall of up to 100 controller boards (16 fans each, one
//! register per fan) over Modbus RTU framing tunneled through TCP.
//! The stack has three layers:
//!
//! - [`frame`]: pure RTU frame building and validation (CRC-16,
//!   write-single 0x06, write-multiple 0x10, exception responses)
//! - [`board`]: one controller per board owning one TCP connection,
//!   translating percent speeds into PWM register writes
//! - [`batch`]: concurrent fan-out across the whole wall with bounded
//!   workers and per-board result maps
//!
//! Expected failures never panic or propagate as errors: operations
//! return `bool` (or per-board maps of `bool`), failure reasons are
//! enumerated in [`error`], and cumulative statistics are available at
//! every level. A speed source (GUI or CLI) supplies percentages; this
//! crate turns them into wire frames.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use fanwall::{BatchController, DEFAULT_MAX_WORKERS};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // 100 boards at 192.168.2.1 .. 192.168.2.100, 16 fans each.
//!     let mut wall = BatchController::with_generated("192.168.2.", 1, 100, 16)?;
//!
//!     let connected = wall.connect_all(DEFAULT_MAX_WORKERS).await;
//!     println!("{} boards online", connected.values().filter(|ok| **ok).count());
//!
//!     wall.set_all_boards_speed(35.0, DEFAULT_MAX_WORKERS).await;
//!     wall.stop_all_boards(DEFAULT_MAX_WORKERS).await;
//!     wall.disconnect_all().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod board;
pub mod config;
pub mod error;
pub mod frame;
pub mod recorder;

pub use batch::{BatchController, BatchStats, BoardStatus, DEFAULT_MAX_WORKERS};
pub use board::{quick_set_all, quick_set_fan, BoardController, CommandStats};
pub use config::{generate_board_configs, BoardConfig, BoardRange, WallConfig};
pub use error::{CommandError, ConnectError, ExceptionCode};
pub use frame::{
    build_write_multiple, build_write_single, crc16, crc16_bytes, parse_response, ResponseFrame,
};
pub use recorder::{BoardEvent, EventSink, FanCommand, MemorySink, TracingSink};
