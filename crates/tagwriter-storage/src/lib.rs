//! Command queue storage for the tagwriter NFC service.
//!
//! In the cloud topology the backend cannot reach the reader, so write
//! requests are persisted as commands and picked up by a local agent. This
//! crate provides the SQLite-backed queue behind that protocol.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool manager with embedded migrations
//! - [`CommandQueue`] - Queue contract (enqueue, claim, report, expire)
//! - [`SqliteCommandQueue`] - SQLite implementation
//!
//! # Command Lifecycle
//!
//! ```text
//! enqueue ──► pending ──claim_next──► in_progress ──report_result──► done
//!                │                                        └─────────► failed
//!                └──────────────expire_pending───────────────────────► failed
//! ```
//!
//! Every status change is a compare-and-swap on `(id, expected status)`. Two
//! agents claiming at once never receive the same command, and a result
//! reported twice keeps the first one.
//!
//! # Examples
//!
//! ```no_run
//! use tagwriter_core::{SubjectRef, TagPayload};
//! use tagwriter_storage::{CommandQueue, CommandResult, Database, DatabaseConfig, SqliteCommandQueue};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(DatabaseConfig::new("tagwriter.db")).await?;
//! let queue = SqliteCommandQueue::new(db.pool().clone());
//!
//! let command = queue
//!     .enqueue(&TagPayload::new("https://vet.example/pet/42")?, &SubjectRef::new("pet-42")?)
//!     .await?;
//!
//! // On the agent side
//! if let Some(claimed) = queue.claim_next().await? {
//!     queue
//!         .report_result(claimed.id, &CommandResult::success("04A23B1C5D6E80"))
//!         .await?;
//! }
//!
//! let done = queue.get(command.id).await?;
//! println!("{:?}", done);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod models;
pub mod repositories;

pub use connection::{Database, DatabaseConfig};
pub use error::{StorageError, StorageResult};
pub use models::{Command, CommandResult};
pub use repositories::{CommandQueue, SqliteCommandQueue};
