use std::net::SocketAddr;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use service::{ChannelStats, Stat};

/// Per-peer counters for the running process, keyed by the peer's member
/// address (mirrors the teacher's worker-independent `Statistics` map, keyed
/// here by channel peer rather than socket/interface pair).
#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<SocketAddr, Arc<ChannelStats>>>>);

impl Statistics {
    pub fn get_reporter(&self) -> StatisticsReporter {
        StatisticsReporter { map: self.0.clone() }
    }

    pub fn snapshot(&self, addr: &SocketAddr) -> Option<[u32; 7]> {
        self.0.read().get(addr).map(|s| s.snapshot())
    }

    pub fn reset(&self, addr: &SocketAddr) {
        if let Some(s) = self.0.read().get(addr) {
            s.reset();
        }
    }
}

#[derive(Clone)]
pub struct StatisticsReporter {
    map: Arc<RwLock<AHashMap<SocketAddr, Arc<ChannelStats>>>>,
}

impl StatisticsReporter {
    pub fn send(&self, addr: &SocketAddr, payload: &[Stat]) {
        let existing = self.map.read().get(addr).cloned();
        let stats = match existing {
            Some(stats) => stats,
            None => {
                let stats = Arc::new(ChannelStats::default());
                self.map.write().insert(*addr, stats.clone());
                stats
            }
        };

        for stat in payload {
            stats.add(stat);
        }
    }
}
