//! Host placement: where new procs go and which procs are removed first.
//!
//! Everything here is a pure function over a snapshot of hosts and the procs
//! observed on them; callers take a fresh snapshot per stage.

use std::collections::{BTreeSet, VecDeque};

use crate::models::{Host, Proc, Swarm};

/// A host together with every proc currently running on it.
#[derive(Clone, Debug)]
pub struct HostSnapshot {
    pub host: Host,
    pub procs: Vec<Proc>,
}

impl HostSnapshot {
    pub fn new(host: Host, procs: Vec<Proc>) -> Self {
        Self { host, procs }
    }

    pub fn swarm_procs<'a>(&'a self, swarm: &'a Swarm) -> impl Iterator<Item = &'a Proc> + 'a {
        self.procs.iter().filter(move |p| swarm.owns(p))
    }

    pub fn used_ports(&self) -> BTreeSet<u16> {
        self.procs.iter().map(|p| p.port).collect()
    }
}

/// Least loaded first: fewest procs of this swarm, then fewest procs
/// overall, then host name.
pub fn prioritize_hosts(mut hosts: Vec<HostSnapshot>, swarm: &Swarm) -> Vec<HostSnapshot> {
    hosts.retain(|snapshot| snapshot.host.active);
    hosts.sort_by(|a, b| {
        let a_key = (a.swarm_procs(swarm).count(), a.procs.len());
        let b_key = (b.swarm_procs(swarm).count(), b.procs.len());
        a_key
            .cmp(&b_key)
            .then_with(|| a.host.name.cmp(&b.host.name))
    });
    hosts
}

/// Lowest port in the host's range that is neither in use nor reserved.
pub fn free_port(host: &Host, used: &BTreeSet<u16>, locked: &BTreeSet<u16>) -> Option<u16> {
    host.ports
        .iter()
        .find(|port| !used.contains(port) && !locked.contains(port))
}

/// Pick `count` procs to remove, busiest host first.
///
/// Only procs accepted by `eligible` are considered. Hosts are ordered by
/// number of eligible procs descending, ties broken by host name ascending,
/// and visited round-robin; each visit takes the host's highest-port proc.
/// Hosts that run dry are skipped.
pub fn select_for_removal<F>(hosts: &[HostSnapshot], count: usize, eligible: F) -> Vec<Proc>
where
    F: Fn(&Proc) -> bool,
{
    let mut queues: Vec<(String, VecDeque<Proc>)> = hosts
        .iter()
        .map(|snapshot| {
            let mut procs: Vec<Proc> = snapshot
                .procs
                .iter()
                .filter(|p| eligible(p))
                .cloned()
                .collect();
            procs.sort_by_key(|p| p.port);
            (snapshot.host.name.clone(), VecDeque::from(procs))
        })
        .filter(|(_, procs)| !procs.is_empty())
        .collect();
    queues.sort_by(|(a_name, a), (b_name, b)| {
        b.len().cmp(&a.len()).then_with(|| a_name.cmp(b_name))
    });

    let mut selected = Vec::with_capacity(count);
    while selected.len() < count {
        let mut progressed = false;
        for (_, procs) in queues.iter_mut() {
            if selected.len() == count {
                break;
            }
            if let Some(proc) = procs.pop_back() {
                selected.push(proc);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PortRange, ReleaseSpec};

    fn host(name: &str) -> Host {
        Host {
            name: name.to_string(),
            squad: "default".into(),
            active: true,
            ports: PortRange::new(5000, 5005),
        }
    }

    fn swarm() -> Swarm {
        Swarm {
            id: 1,
            app_name: "app".into(),
            tag: "v1".into(),
            config_name: "prod".into(),
            proc_name: "web".into(),
            squad: "default".into(),
            size: 1,
            pool: None,
            balancer: "lb1".into(),
            release_id: 1,
            spec: ReleaseSpec::default(),
        }
    }

    fn proc(host: &str, port: u16, hash: &str) -> Proc {
        Proc {
            host: host.to_string(),
            name: format!("app-v1-prod-{hash}-web-{port}"),
            app_name: "app".into(),
            version: "v1".into(),
            config_name: "prod".into(),
            proc_name: "web".into(),
            release_hash: hash.to_string(),
            port,
        }
    }

    #[test]
    fn least_loaded_hosts_come_first() {
        let hosts = vec![
            HostSnapshot::new(host("h2"), vec![proc("h2", 5000, "x")]),
            HostSnapshot::new(host("h3"), vec![]),
            HostSnapshot::new(host("h1"), vec![]),
        ];
        let names: Vec<String> = prioritize_hosts(hosts, &swarm())
            .into_iter()
            .map(|s| s.host.name)
            .collect();
        assert_eq!(names, vec!["h1", "h3", "h2"]);
    }

    #[test]
    fn inactive_hosts_are_never_prioritized() {
        let mut idle = host("h0");
        idle.active = false;
        let hosts = vec![HostSnapshot::new(idle, vec![]), HostSnapshot::new(host("h1"), vec![])];
        assert_eq!(prioritize_hosts(hosts, &swarm()).len(), 1);
    }

    #[test]
    fn free_port_skips_used_and_locked() {
        let used: BTreeSet<u16> = [5000].into_iter().collect();
        let locked: BTreeSet<u16> = [5001].into_iter().collect();
        assert_eq!(free_port(&host("h1"), &used, &locked), Some(5002));

        let all: BTreeSet<u16> = (5000..5005).collect();
        assert_eq!(free_port(&host("h1"), &all, &BTreeSet::new()), None);
    }

    #[test]
    fn removal_prefers_busiest_hosts_round_robin() {
        let hosts = vec![
            HostSnapshot::new(host("h1"), vec![proc("h1", 5000, "a"), proc("h1", 5001, "a")]),
            HostSnapshot::new(
                host("h2"),
                vec![
                    proc("h2", 5000, "a"),
                    proc("h2", 5001, "a"),
                    proc("h2", 5002, "a"),
                ],
            ),
        ];
        let picked: Vec<(String, u16)> = select_for_removal(&hosts, 3, |_| true)
            .into_iter()
            .map(|p| (p.host, p.port))
            .collect();
        assert_eq!(
            picked,
            vec![
                ("h2".to_string(), 5002),
                ("h1".to_string(), 5001),
                ("h2".to_string(), 5001)
            ]
        );
    }

    #[test]
    fn removal_ties_break_by_host_name() {
        let hosts = vec![
            HostSnapshot::new(host("h9"), vec![proc("h9", 5000, "a")]),
            HostSnapshot::new(host("h1"), vec![proc("h1", 5000, "a")]),
        ];
        let picked = select_for_removal(&hosts, 1, |_| true);
        assert_eq!(picked[0].host, "h1");
    }

    #[test]
    fn removal_only_considers_eligible_procs_and_stops_when_dry() {
        let hosts = vec![HostSnapshot::new(
            host("h1"),
            vec![proc("h1", 5000, "old"), proc("h1", 5001, "new")],
        )];
        let picked = select_for_removal(&hosts, 5, |p| p.release_hash == "new");
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].port, 5001);
    }
}
