//! # Word Lobby Server Library
//!
//! This library provides the authoritative server for a multiplayer
//! word-guessing party game. One player hosts a lobby and supplies the secret
//! words; other players join, learn the words and race to guess them. The
//! server owns lobby membership, the word list and give-up votes, and keeps
//! every connected player in a lobby up to date.
//!
//! ## Core Responsibilities
//!
//! ### Lobby Lifecycle
//! Lobbies are created when a host connects, become joinable once the host
//! has listed its words, and disappear when the last connected player leaves.
//! Players who leave stay on the roster as disconnected entries so names and
//! solved words stay attributed.
//!
//! ### Protocol State Machine
//! Each connection moves through four phases (just connected, receiving
//! words, getting a name, playing) and each phase accepts its own small set
//! of text messages. Anything else is ignored.
//!
//! ### Broadcasting
//! Guesses, give-up votes, joins and quits are fanned out to every connected
//! player in the lobby while the lobby is locked, so all players see the same
//! order of events.
//!
//! ## Module Organization
//!
//! ### Client Module (`client`)
//! Handle to a live connection: an id and a bounded outbound queue drained by
//! that connection's socket writer.
//!
//! ### Lobby Module (`lobby`)
//! One game's roster, words and give-up votes behind a per-lobby mutex.
//!
//! ### Registry Module (`registry`)
//! The process-wide table of lobbies and lobby id allocation.
//!
//! ### Session Module (`session`)
//! The per-connection phase machine and the broadcaster.
//!
//! ### Network Module (`network`)
//! TCP listener, WebSocket handshake and the reader/writer tasks that connect
//! sockets to sessions.
//!
//! ## Locking
//!
//! There are two kinds of lock: one for the registry and one per lobby. When
//! an operation needs both, the registry lock is taken first. No operation
//! ever holds two lobby locks at once.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new("127.0.0.1:8080", 1000).await?;
//!     server.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod lobby;
pub mod network;
pub mod registry;
pub mod session;
