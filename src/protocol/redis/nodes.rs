use anyhow::{bail, Result};
use hashbrown::HashMap;

use super::SLOT_COUNT;

/// Slot ownership learned from `CLUSTER NODES`.
///
/// One entry per slot; empty strings mark uncovered slots, which fail fast
/// at routing time.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    masters: Vec<String>,
    replicas: Vec<Vec<String>>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            masters: vec![String::new(); SLOT_COUNT as usize],
            replicas: vec![Vec::new(); SLOT_COUNT as usize],
        }
    }

    /// Parse the bulk payload of a `CLUSTER NODES` reply.
    ///
    /// Line shape: `<id> <ip:port@cport> <flags> <master-id> <ping> <pong>
    /// <epoch> <link-state> [<slot-or-range>...]`. Replica lines reference
    /// their master by node id and may precede it, so ownership is resolved
    /// in two passes.
    pub fn from_nodes_payload(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)?;
        let mut map = Self::new();

        struct Line<'a> {
            id: &'a str,
            addr: String,
            is_master: bool,
            master_id: &'a str,
            slots: Vec<(usize, usize)>,
        }

        let mut lines = Vec::new();
        for raw in text.lines() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let fields: Vec<&str> = raw.split(' ').collect();
            if fields.len() < 8 {
                bail!("short CLUSTER NODES line: {}", raw);
            }
            let flags = fields[2];
            if flags.contains("fail") || flags.contains("handshake") || flags.contains("noaddr") {
                continue;
            }
            let addr = fields[1]
                .split('@')
                .next()
                .unwrap_or(fields[1])
                .to_string();
            if addr.is_empty() || addr.starts_with(':') {
                continue;
            }

            let mut slots = Vec::new();
            for token in &fields[8..] {
                // migration markers like [42->-abcd] are transient; skip them
                if token.starts_with('[') {
                    continue;
                }
                let (begin, end) = match token.split_once('-') {
                    Some((b, e)) => (b.parse::<usize>()?, e.parse::<usize>()?),
                    None => {
                        let single = token.parse::<usize>()?;
                        (single, single)
                    }
                };
                if begin > end || end >= SLOT_COUNT as usize {
                    bail!("slot range {} out of bounds", token);
                }
                slots.push((begin, end));
            }

            lines.push(Line {
                id: fields[0],
                addr,
                is_master: flags.contains("master"),
                master_id: fields[3],
                slots,
            });
        }

        let mut master_addr_by_id: HashMap<&str, String> = HashMap::new();
        for line in lines.iter().filter(|l| l.is_master) {
            master_addr_by_id.insert(line.id, line.addr.clone());
            for &(begin, end) in &line.slots {
                for slot in begin..=end {
                    map.masters[slot] = line.addr.clone();
                }
            }
        }

        let mut replicas_by_master: HashMap<String, Vec<String>> = HashMap::new();
        for line in lines.iter().filter(|l| !l.is_master) {
            if let Some(master_addr) = master_addr_by_id.get(line.master_id) {
                replicas_by_master
                    .entry(master_addr.clone())
                    .or_default()
                    .push(line.addr.clone());
            }
        }

        for slot in 0..SLOT_COUNT as usize {
            if let Some(replicas) = replicas_by_master.get(&map.masters[slot]) {
                map.replicas[slot] = replicas.clone();
            }
        }

        Ok(map)
    }

    pub fn master_for_slot(&self, slot: u16) -> Option<&str> {
        self.masters
            .get(slot as usize)
            .and_then(|s| if s.is_empty() { None } else { Some(s.as_str()) })
    }

    pub fn replicas_for_slot(&self, slot: u16) -> &[String] {
        self.replicas
            .get(slot as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Point one slot at a new master, as taught by a MOVED redirect.
    /// Returns true when the entry actually changed.
    pub fn set_master(&mut self, slot: u16, addr: &str) -> bool {
        let entry = &mut self.masters[slot as usize];
        if entry == addr {
            return false;
        }
        *entry = addr.to_string();
        self.replicas[slot as usize].clear();
        true
    }

    /// True when no slot has an owner yet.
    pub fn is_empty(&self) -> bool {
        self.masters.iter().all(|m| m.is_empty())
    }

    /// Count of slots without an owner.
    pub fn uncovered_slots(&self) -> usize {
        self.masters.iter().filter(|m| m.is_empty()).count()
    }

    /// Distinct masters in slot order; the stable node list SCAN iterates.
    pub fn ordered_masters(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for master in &self.masters {
            if !master.is_empty() && !out.contains(master) {
                out.push(master.clone());
            }
        }
        out
    }

    /// Every known address, masters then replicas, deduplicated.
    pub fn all_nodes(&self) -> Vec<String> {
        let mut out = self.ordered_masters();
        for entry in &self.replicas {
            for replica in entry {
                if !out.contains(replica) {
                    out.push(replica.clone());
                }
            }
        }
        out
    }

    /// True when the layouts differ; drives the stats version bump.
    pub fn differs_from(&self, other: &SlotMap) -> bool {
        self.masters != other.masters || self.replicas != other.replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn parses_masters_and_replicas() {
        let map = SlotMap::from_nodes_payload(NODES.as_bytes()).unwrap();
        assert_eq!(map.master_for_slot(0), Some("127.0.0.1:30001"));
        assert_eq!(map.master_for_slot(5461), Some("127.0.0.1:30002"));
        assert_eq!(map.master_for_slot(16383), Some("127.0.0.1:30003"));
        assert_eq!(
            map.replicas_for_slot(100),
            &["127.0.0.1:30004".to_string()]
        );
        assert!(map.replicas_for_slot(5461).is_empty());
        assert_eq!(map.uncovered_slots(), 0);
    }

    #[test]
    fn ordered_masters_follow_slot_order() {
        let map = SlotMap::from_nodes_payload(NODES.as_bytes()).unwrap();
        assert_eq!(
            map.ordered_masters(),
            vec![
                "127.0.0.1:30001".to_string(),
                "127.0.0.1:30002".to_string(),
                "127.0.0.1:30003".to_string(),
            ]
        );
        assert_eq!(map.all_nodes().len(), 4);
    }

    #[test]
    fn moved_learning_updates_one_slot() {
        let mut map = SlotMap::from_nodes_payload(NODES.as_bytes()).unwrap();
        assert!(map.set_master(12539, "10.0.0.7:6379"));
        assert_eq!(map.master_for_slot(12539), Some("10.0.0.7:6379"));
        assert_eq!(map.master_for_slot(12540), Some("127.0.0.1:30003"));
        // idempotent
        assert!(!map.set_master(12539, "10.0.0.7:6379"));
    }

    #[test]
    fn failed_nodes_and_migration_markers_are_skipped() {
        let payload = "\
aa 127.0.0.1:7000@17000 master,fail - 0 0 1 connected 0-16383
bb 127.0.0.1:7001@17001 myself,master - 0 0 2 connected 0-16382 [5->-cc]
";
        let map = SlotMap::from_nodes_payload(payload.as_bytes()).unwrap();
        assert_eq!(map.master_for_slot(0), Some("127.0.0.1:7001"));
        assert_eq!(map.master_for_slot(16383), None);
        assert_eq!(map.uncovered_slots(), 1);
    }

    #[test]
    fn short_lines_are_rejected() {
        assert!(SlotMap::from_nodes_payload(b"garbage line").is_err());
    }
}
