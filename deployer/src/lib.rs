// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisions RavenDB clusters over SSH and drives them to a declared
//! membership, database and index layout through the admin API.
//!
//! A deployment runs in two phases. [`provision::deploy_fleet`] installs and
//! configures the server on every host; [`reconcile::Reconciler`] then joins
//! the nodes into one cluster and converges its databases.

pub mod bundle;
pub mod config;
pub mod dns;
mod error_chain;
pub mod fleet;
pub mod model;
pub mod package;
pub mod provision;
pub mod reconcile;
pub mod retry;
pub mod settings;
pub mod state;
pub mod teardown;

pub use error_chain::InlineErrorChain;
