//! Access filter pipeline.
//!
//! Pure functions from (sessions, gateway) to the devices that gateway may
//! see, and from (session, gateways) to the gateways a device may see. No
//! I/O happens here; privileged subjects are passed in already fetched.

use std::collections::HashSet;

use crate::storage::{Device, Gateway, Session};

/// Devices `gateway` should currently admit.
///
/// `privileged` is the cached JITA grant list for this gateway. `None`
/// means no list is available, so a privileged gateway admits nobody.
/// Sessions that expired before `now` never authorize.
pub fn devices_for_gateway(
    gateway: &Gateway,
    sessions: &[Session],
    privileged: Option<&HashSet<String>>,
    now: i64,
) -> Vec<Device> {
    let live = sessions.iter().filter(|s| !s.expired_at(now));
    let privileged = privileged_filter(gateway, live, privileged);
    let authorized = privileged.filter(|s| groups_intersect(&s.groups, &gateway.access_group_ids));
    let healthy = authorized.map(|s| &s.device).filter(|d| d.healthy);
    dedup_devices(healthy)
}

/// Gateways whose access groups intersect the device's session groups.
pub fn gateways_for_session(session: &Session, gateways: &[Gateway]) -> Vec<Gateway> {
    gateways
        .iter()
        .filter(|gw| groups_intersect(&session.groups, &gw.access_group_ids))
        .cloned()
        .collect()
}

fn privileged_filter<'a>(
    gateway: &'a Gateway,
    sessions: impl Iterator<Item = &'a Session> + 'a,
    privileged: Option<&'a HashSet<String>>,
) -> impl Iterator<Item = &'a Session> + 'a {
    sessions.filter(move |s| {
        if !gateway.requires_privileged_access {
            return true;
        }
        privileged.is_some_and(|subjects| subjects.contains(&s.object_id))
    })
}

/// Any shared group grants access.
pub fn groups_intersect(session_groups: &[String], gateway_groups: &[String]) -> bool {
    session_groups.iter().any(|g| gateway_groups.contains(g))
}

fn dedup_devices<'a>(devices: impl Iterator<Item = &'a Device>) -> Vec<Device> {
    let mut seen = HashSet::new();
    devices
        .filter(|d| seen.insert(d.id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn device(id: i64, healthy: bool) -> Device {
        Device {
            id,
            serial: format!("SER-{id}"),
            platform: "linux".into(),
            username: format!("user{id}@example.com"),
            public_key: format!("pk-{id}"),
            ip: format!("10.255.240.{}", id + 1),
            healthy,
            last_updated: None,
            last_seen: None,
        }
    }

    fn session(key: &str, device: Device, groups: &[&str], subject: &str) -> Session {
        Session {
            key: key.into(),
            expiry: NOW + 3600,
            device,
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            object_id: subject.into(),
        }
    }

    fn gateway(groups: &[&str], privileged: bool) -> Gateway {
        Gateway {
            name: "gw".into(),
            public_key: "gw-pk".into(),
            endpoint: "203.0.113.7:51820".into(),
            ip: "10.255.240.2".into(),
            access_group_ids: groups.iter().map(|g| (*g).to_string()).collect(),
            routes: vec!["10.10.0.0/16".into()],
            password_hash: String::new(),
            requires_privileged_access: privileged,
        }
    }

    fn ids(devices: &[Device]) -> Vec<i64> {
        devices.iter().map(|d| d.id).collect()
    }

    #[test]
    fn shared_group_authorizes_healthy_device() {
        let gw = gateway(&["g1", "g2"], false);
        let sessions = vec![session("a", device(1, true), &["g1"], "s1")];
        assert_eq!(ids(&devices_for_gateway(&gw, &sessions, None, NOW)), vec![1]);

        let outsider = vec![session("a", device(1, true), &["g3"], "s1")];
        assert!(devices_for_gateway(&gw, &outsider, None, NOW).is_empty());
    }

    #[test]
    fn unhealthy_device_is_excluded_even_when_authorized() {
        let gw = gateway(&["g1"], false);
        let sessions = vec![session("a", device(1, false), &["g1"], "s1")];
        assert!(devices_for_gateway(&gw, &sessions, None, NOW).is_empty());
    }

    #[test]
    fn multi_login_yields_one_device_entry() {
        let gw = gateway(&["g1"], false);
        let sessions = vec![
            session("a", device(1, true), &["g1"], "s1"),
            session("b", device(1, true), &["g1"], "s1"),
            session("c", device(2, true), &["g1"], "s2"),
        ];
        assert_eq!(ids(&devices_for_gateway(&gw, &sessions, None, NOW)), vec![1, 2]);
    }

    #[test]
    fn privileged_gateway_needs_a_grant() {
        let gw = gateway(&["g1"], true);
        let sessions = vec![
            session("a", device(1, true), &["g1"], "granted"),
            session("b", device(2, true), &["g1"], "not-granted"),
        ];
        let grants: HashSet<String> = ["granted".to_string()].into();

        assert_eq!(
            ids(&devices_for_gateway(&gw, &sessions, Some(&grants), NOW)),
            vec![1]
        );
        assert!(devices_for_gateway(&gw, &sessions, None, NOW).is_empty());
    }

    #[test]
    fn grant_without_group_is_not_enough() {
        let gw = gateway(&["g1"], true);
        let sessions = vec![session("a", device(1, true), &["g9"], "granted")];
        let grants: HashSet<String> = ["granted".to_string()].into();
        assert!(devices_for_gateway(&gw, &sessions, Some(&grants), NOW).is_empty());
    }

    #[test]
    fn expired_session_never_authorizes() {
        let gw = gateway(&["g1"], false);
        let mut stale = session("a", device(1, true), &["g1"], "s1");
        stale.expiry = NOW - 1;
        assert!(devices_for_gateway(&gw, &[stale], None, NOW).is_empty());
    }

    #[test]
    fn pipeline_is_idempotent() {
        let gw = gateway(&["g1", "g2"], false);
        let sessions = vec![
            session("a", device(1, true), &["g1"], "s1"),
            session("b", device(2, false), &["g2"], "s2"),
            session("c", device(3, true), &["g2"], "s3"),
            session("d", device(1, true), &["g2"], "s1"),
        ];
        let first = devices_for_gateway(&gw, &sessions, None, NOW);
        let second = devices_for_gateway(&gw, &sessions, None, NOW);
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec![1, 3]);
    }

    #[test]
    fn device_sees_gateways_sharing_a_group_regardless_of_health() {
        let s = session("a", device(1, false), &["g2"], "s1");
        let mut visible = gateway(&["g1", "g2"], true);
        visible.name = "visible".into();
        let mut hidden = gateway(&["g3"], false);
        hidden.name = "hidden".into();

        let seen = gateways_for_session(&s, &[visible, hidden]);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "visible");
    }
}
