//! In-flight request accounting.

use std::ops::Deref;
use std::sync::Arc;

use crate::runtime::cluster::ClusterInfo;
use crate::runtime::destination::DestinationInfo;

/// RAII guard holding one in-flight request against a cluster and destination.
/// Both counters are decremented on drop.
#[derive(Debug)]
pub struct ConcurrencyGuard {
    cluster: Arc<ClusterInfo>,
    destination: Arc<DestinationInfo>,
}

impl ConcurrencyGuard {
    pub fn new(cluster: Arc<ClusterInfo>, destination: Arc<DestinationInfo>) -> Self {
        cluster.inc_requests();
        destination.inc_requests();
        Self { cluster, destination }
    }

    pub fn cluster(&self) -> &Arc<ClusterInfo> {
        &self.cluster
    }
}

impl Deref for ConcurrencyGuard {
    type Target = Arc<DestinationInfo>;
    fn deref(&self) -> &Self::Target {
        &self.destination
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.destination.dec_requests();
        self.cluster.dec_requests();
    }
}
