//! # ExifTool stay-open
//!
//! Keeps Phil Harvey's ExifTool running between requests instead of paying
//! Perl's startup cost for every file.
//!
//! [`StayOpen`] owns one `exiftool -stay_open True -@ -` process and answers
//! one request at a time. [`Pool`] holds several of them and hands requests
//! out round-robin, so callers on different threads are served in parallel.
//!
//! Responses are returned as raw bytes, exactly as ExifTool printed them
//! before its `{ready}` marker. Decoding them (usually with `serde_json`) is
//! left to the caller.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use exiftool_stayopen::StayOpen;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let exiftool = StayOpen::new()?; // Starts `exiftool` from PATH with `-json`
//!
//!     let record = exiftool.extract("path/to/your/image.jpg")?;
//!     let json: serde_json::Value = serde_json::from_slice(&record)?;
//!     println!("Make: {}", json[0]["Make"]);
//!
//!     // Extra arguments apply to this request only.
//!     let record = exiftool.extract_with_options("path/to/your/image.jpg", &["-ShutterSpeed"])?;
//!     println!("{}", String::from_utf8_lossy(&record));
//!
//!     // Also happens when `exiftool` goes out of scope.
//!     exiftool.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Pool
//!
//! ```no_run
//! use exiftool_stayopen::{ExifToolError, Pool, StayOpenConfig};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), ExifToolError> {
//!     let config = StayOpenConfig::default()
//!         .with_default_args(&["-json", "-n"])
//!         .with_shutdown_timeout(Duration::from_secs(2));
//!     let pool = Pool::with_config(config, 4)?;
//!
//!     for file in ["a.jpg", "b.jpg"] {
//!         match pool.extract(file) {
//!             Ok(record) => println!("{file}: {} bytes", record.len()),
//!             Err(ExifToolError::FileNotFound { path, .. }) => println!("{} is gone", path.display()),
//!             Err(e) => return Err(e),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod error;
pub mod framing;
mod pool;
mod stay_open;

pub use config::StayOpenConfig;
pub use error::ExifToolError;
pub use pool::{Pool, PoolStats};
pub use stay_open::StayOpen;

mod utils;
