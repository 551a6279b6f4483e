//! sysfs hotplug poller and node-access permission host.
//!
//! V4L2 capture nodes are grouped by the USB device they belong to, so a
//! combined endpoint shows up as one identity with one node per sensor.
//! Attach and detach are found by diffing successive scans.

use crate::engine::{EngineEvent, EngineHandle};
use dualcam_hw::quirks::read_usb_ids;
use dualcam_hw::{ControlHandle, DeviceIdentity, UsbHost, UsbId};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SYSFS_VIDEO_CLASS: &str = "/sys/class/video4linux";
const DEV_DIR: &str = "/dev";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Attach(DeviceIdentity),
    Detach(UsbId),
}

/// Capture nodes per USB device, in node-number order.
///
/// Metadata nodes (a non-zero `index` attribute) are skipped.
pub fn scan(class_dir: &Path, dev_dir: &Path) -> BTreeMap<UsbId, ControlHandle> {
    let mut found: BTreeMap<UsbId, Vec<(u32, String)>> = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(class_dir) else {
        return BTreeMap::new();
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(number) = name.strip_prefix("video").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let node_dir = entry.path();
        if let Ok(index) = std::fs::read_to_string(node_dir.join("index")) {
            if index.trim() != "0" {
                continue;
            }
        }
        // <class>/videoN/device links to the USB interface; its parent is the device.
        let Ok(interface_dir) = std::fs::canonicalize(node_dir.join("device")) else {
            continue;
        };
        let Some(id) = interface_dir.parent().and_then(read_usb_ids) else {
            continue;
        };
        let node = dev_dir.join(name).to_string_lossy().into_owned();
        found.entry(id).or_default().push((number, node));
    }

    found
        .into_iter()
        .map(|(id, mut nodes)| {
            nodes.sort();
            (id, ControlHandle::new(nodes.into_iter().map(|(_, n)| n).collect()))
        })
        .collect()
}

/// Remembers the previous scan and reports what changed.
#[derive(Debug, Default)]
pub struct Tracker {
    known: BTreeMap<UsbId, ControlHandle>,
}

impl Tracker {
    pub fn update(&mut self, current: BTreeMap<UsbId, ControlHandle>) -> Vec<HotplugEvent> {
        let mut events = Vec::new();
        for (id, handle) in &self.known {
            // A changed node set is a re-enumeration: detach, then attach.
            if current.get(id) != Some(handle) {
                events.push(HotplugEvent::Detach(*id));
            }
        }
        for (id, handle) in &current {
            if self.known.get(id) != Some(handle) {
                events.push(HotplugEvent::Attach(DeviceIdentity::new(*id, handle.clone())));
            }
        }
        self.known = current;
        events
    }
}

/// Poll sysfs every `interval` and post attach/detach events to the engine.
pub fn spawn_poller(engine: EngineHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = Tracker::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let current = scan(Path::new(SYSFS_VIDEO_CLASS), Path::new(DEV_DIR));
            for event in tracker.update(current) {
                let posted = match event {
                    HotplugEvent::Attach(identity) => {
                        tracing::info!(device = %identity.id, nodes = ?identity.handle.nodes(), "USB camera attached");
                        engine.post(EngineEvent::Attach(identity))
                    }
                    HotplugEvent::Detach(id) => {
                        tracing::info!(device = %id, "USB camera detached");
                        engine.post(EngineEvent::Detach(id))
                    }
                };
                if !posted {
                    tracing::debug!("engine gone; hotplug poller exiting");
                    return;
                }
            }
        }
    })
}

/// Decides whether the daemon may use a device.
pub type PermissionCheck = Arc<dyn Fn(&DeviceIdentity) -> bool + Send + Sync>;

/// Granted when every capture node of the device is readable and writable.
pub fn node_access(identity: &DeviceIdentity) -> bool {
    !identity.handle.nodes().is_empty()
        && identity.handle.nodes().iter().all(|node| {
            let Ok(path) = CString::new(Path::new(node).as_os_str().as_bytes()) else {
                return false;
            };
            // SAFETY: `path` is a valid NUL-terminated string for the duration of the call.
            unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
        })
}

/// Answers permission requests through the engine queue, never inline.
pub struct AccessHost {
    engine: EngineHandle,
    check: PermissionCheck,
}

impl AccessHost {
    pub fn new(engine: EngineHandle, check: PermissionCheck) -> Self {
        Self { engine, check }
    }
}

impl UsbHost for AccessHost {
    fn request_permission(&self, identity: &DeviceIdentity) {
        let granted = (self.check)(identity);
        tracing::info!(device = %identity.id, granted, "permission checked");
        self.engine.post(EngineEvent::Permission {
            id: identity.id,
            granted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;

    struct FakeSysfs {
        root: PathBuf,
    }

    impl FakeSysfs {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!("dualcam-hotplug-{tag}-{}", std::process::id()));
            let _ = std::fs::remove_dir_all(&root);
            std::fs::create_dir_all(root.join("class")).unwrap();
            Self { root }
        }

        fn class(&self) -> PathBuf {
            self.root.join("class")
        }

        fn usb_device(&self, port: &str, vid: &str, pid: &str) {
            let dir = self.root.join("usb").join(port);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("idVendor"), format!("{vid}\n")).unwrap();
            std::fs::write(dir.join("idProduct"), format!("{pid}\n")).unwrap();
        }

        fn node(&self, number: u32, port: &str, interface: u32, index: u32) {
            let iface = self.root.join("usb").join(port).join(format!("{port}:1.{interface}"));
            std::fs::create_dir_all(&iface).unwrap();
            let node = self.class().join(format!("video{number}"));
            std::fs::create_dir_all(&node).unwrap();
            std::fs::write(node.join("index"), format!("{index}\n")).unwrap();
            symlink(&iface, node.join("device")).unwrap();
        }
    }

    impl Drop for FakeSysfs {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn test_scan_groups_nodes_by_device() {
        let sys = FakeSysfs::new("group");
        sys.usb_device("1-1", "0bda", "5840");
        sys.usb_device("1-2", "0bda", "3901");
        sys.node(2, "1-1", 0, 0);
        sys.node(3, "1-1", 0, 1);
        sys.node(4, "1-1", 2, 0);
        sys.node(0, "1-2", 0, 0);

        let found = scan(&sys.class(), Path::new("/dev"));
        assert_eq!(found.len(), 2);
        assert_eq!(
            found[&UsbId::new(0x0bda, 0x5840)].nodes(),
            ["/dev/video2".to_string(), "/dev/video4".to_string()]
        );
        assert_eq!(
            found[&UsbId::new(0x0bda, 0x3901)].nodes(),
            ["/dev/video0".to_string()]
        );
    }

    #[test]
    fn test_scan_missing_class_dir() {
        assert!(scan(Path::new("/definitely/not/sysfs"), Path::new("/dev")).is_empty());
    }

    #[test]
    fn test_tracker_reports_changes() {
        let ir = UsbId::new(0x0bda, 0x5830);
        let vl = UsbId::new(0x0bda, 0x3901);
        let mut tracker = Tracker::default();

        let first = BTreeMap::from([(ir, ControlHandle::single("/dev/video0"))]);
        assert_eq!(
            tracker.update(first.clone()),
            vec![HotplugEvent::Attach(DeviceIdentity::new(ir, ControlHandle::single("/dev/video0")))]
        );
        assert!(tracker.update(first).is_empty());

        let second = BTreeMap::from([(vl, ControlHandle::single("/dev/video2"))]);
        let events = tracker.update(second);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], HotplugEvent::Detach(ir));
        assert!(matches!(&events[1], HotplugEvent::Attach(d) if d.id == vl));
    }

    #[test]
    fn test_renumbered_device_reattaches() {
        let ir = UsbId::new(0x0bda, 0x5830);
        let mut tracker = Tracker::default();
        tracker.update(BTreeMap::from([(ir, ControlHandle::single("/dev/video0"))]));
        let events = tracker.update(BTreeMap::from([(ir, ControlHandle::single("/dev/video4"))]));
        assert_eq!(events[0], HotplugEvent::Detach(ir));
        assert!(matches!(&events[1], HotplugEvent::Attach(d) if d.handle.nodes() == ["/dev/video4".to_string()]));
    }

    #[test]
    fn test_node_access() {
        let ir = UsbId::new(0x0bda, 0x5830);
        assert!(!node_access(&DeviceIdentity::new(ir, ControlHandle::default())));
        assert!(!node_access(&DeviceIdentity::new(
            ir,
            ControlHandle::single("/dev/video-does-not-exist")
        )));

        let file = std::env::temp_dir().join(format!("dualcam-access-{}", std::process::id()));
        std::fs::write(&file, b"").unwrap();
        let handle = ControlHandle::single(file.to_string_lossy());
        assert!(node_access(&DeviceIdentity::new(ir, handle)));
        std::fs::remove_file(&file).unwrap();
    }
}
