// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for making requests to the administrative API of a RavenDB
//! cluster.
//!
//! Callers build a [`ServerOperation`] (cluster-wide) or a
//! [`MaintenanceOperation`] (scoped to one database) and hand it to an
//! [`AdminClient`]. Failures are classified into [`AdminError`] variants so
//! that callers can tell transient cluster conditions from real errors.

mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
mod http;
mod operations;
pub mod types;

use async_trait::async_trait;

pub use error::AdminError;
pub use http::ClientIdentity;
pub use http::HttpAdminClient;
pub use operations::Body;
pub use operations::MaintenanceOperation;
pub use operations::Method;
pub use operations::OperationResponse;
pub use operations::RequestSpec;
pub use operations::ResponseKind;
pub use operations::ServerOperation;

#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn send_server_operation(
        &self,
        op: &ServerOperation,
    ) -> Result<OperationResponse, AdminError>;

    async fn send_maintenance_operation(
        &self,
        op: &MaintenanceOperation,
        database: &str,
    ) -> Result<OperationResponse, AdminError>;
}
