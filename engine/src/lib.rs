// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Escrow Engine: Core Library
//!
//! Holds a buyer's money in custody until the seller delivers, and settles
//! it either way when they disagree. Everything that decides where the money
//! goes lives here; the HTTP node in `escrow-node` is a thin shell.
//!
//! ## Architecture
//!
//! - **fees**: Platform fee quotes. Pure integer math.
//! - **verification**: Identity tier required for an amount.
//! - **transaction**: The escrow record and its state machine.
//! - **milestone**: Splitting a total into sequenced sub-payments.
//! - **dispute**: Evidence, mediation and rulings.
//! - **reputation**: Per-user trust records with atomic updates.
//! - **payout**: Periodic aggregation of seller earnings.
//! - **engine**: The service layer tying all of the above to storage and
//!   the payment gateway, with locking and deadline sweeps.
//! - **gateway**: Traits for the payment processor, mediator directory and
//!   notifier, plus sandbox implementations.
//! - **storage**: In-memory and sled-backed persistence.
//! - **config**: Every business number in one place.
//!
//! ## Ground Rules
//!
//! 1. Money is `u64` minor units. No floats touch it.
//! 2. A failed gateway call changes nothing.
//! 3. Every state change leaves exactly one audit entry.
//! 4. If it touches money, it has tests.

pub mod config;
pub mod dispute;
pub mod engine;
pub mod error;
pub mod fees;
pub mod gateway;
pub mod milestone;
pub mod payout;
pub mod reputation;
pub mod storage;
pub mod transaction;
pub mod verification;

pub use config::EngineConfig;
pub use engine::{EscrowEngine, SweepReport};
pub use error::{EscrowError, EscrowResult};
