//! In-process transport straight into a [`Registry`].

use std::sync::Arc;

use guestproc::broker::BrokerTransport;
use guestproc::protocol::{BrokerStatus, Reply, Request};

use crate::registry::{Registry, SessionId};

/// One registry session, closed when the transport is dropped.
pub struct LocalTransport {
    registry: Arc<Registry>,
    session: SessionId,
}

impl LocalTransport {
    pub fn open(registry: Arc<Registry>) -> Self {
        let session = registry.open_session();
        Self { registry, session }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }
}

impl BrokerTransport for LocalTransport {
    fn call(&mut self, request: &Request) -> Result<Reply, BrokerStatus> {
        self.registry.handle(self.session, request.clone())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.registry.close_session(self.session);
    }
}
