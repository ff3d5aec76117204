// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod audit;
mod info;

pub use audit::{hash_digest, AuditEntry, AuditLog};
pub use info::system_info_block;
