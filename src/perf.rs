//! # Perf
//!
//! Hardware performance counters addressed by event name. A [`CounterBackend`] opens, enables,
//! reads and closes individual counters; a [`CounterGroup`] owns the five counters of one
//! measurement (a cycles leader plus L1D, L2, L3 and TLB miss followers) and releases them in
//! reverse-of-open order when dropped.
//!
//! An event the CPU does not support is an expected outcome on heterogeneous hardware, so opening
//! reports it as [`OpenOutcome::Unsupported`] rather than as an error.
use crate::events::{self, EventSet};
use log::{debug, error, warn};
use std::fs::File;
use std::io::{self, Read};

/// Result of opening one counter
#[derive(Debug)]
pub enum OpenOutcome<H> {
    Opened(H),
    Unsupported(String),
}

/// A source of hardware counters
pub trait CounterBackend {
    type Handle;

    /// Open `event`. With `leader: None` the counter starts a new group (disabled until enabled);
    /// otherwise it joins the leader's group and follows its enable state.
    fn open(&mut self, event: &str, leader: Option<&Self::Handle>) -> OpenOutcome<Self::Handle>;

    fn enable(&mut self, handle: &Self::Handle) -> io::Result<()>;

    fn disable(&mut self, handle: &Self::Handle) -> io::Result<()>;

    /// Current monotonic count of the counter
    fn read(&mut self, handle: &Self::Handle) -> io::Result<u64>;

    fn close(&mut self, handle: Self::Handle);
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterError {
    #[error("Failed to open performance counter for event '{0}'")]
    Unsupported(String),
    #[error("Failed to enable counter group led by '{event}': {reason}")]
    Enable { event: String, reason: String },
    #[error("Failed to read counter '{event}': {reason}")]
    Read { event: String, reason: String },
}

/// Snapshot (or delta) of the four miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissCounts {
    pub l1d: u64,
    pub l2: u64,
    pub l3: u64,
    pub tlb: u64,
}

impl MissCounts {
    /// Counts accumulated between `start` and `self`
    pub fn since(&self, start: &MissCounts) -> MissCounts {
        MissCounts {
            l1d: self.l1d.wrapping_sub(start.l1d),
            l2: self.l2.wrapping_sub(start.l2),
            l3: self.l3.wrapping_sub(start.l3),
            tlb: self.tlb.wrapping_sub(start.tlb),
        }
    }
}

/// Counter group of one measurement: cycles leader followed by L1D, L2, L3 and TLB miss counters
pub struct CounterGroup<'b, B: CounterBackend> {
    backend: &'b mut B,
    leader_event: String,
    leader: Option<B::Handle>,
    /// Event name and handle of L1D, L2, L3, TLB in open order
    followers: Vec<(String, B::Handle)>,
    enabled: bool,
}

impl<'b, B: CounterBackend> CounterGroup<'b, B> {
    /// Open the leader standalone, then each follower against it. On the first unsupported event
    /// every counter opened so far is closed again.
    pub fn open(backend: &'b mut B, events: &EventSet) -> Result<Self, CounterError> {
        let leader = match backend.open(&events.cycles, None) {
            OpenOutcome::Opened(handle) => handle,
            OpenOutcome::Unsupported(event) => {
                error!("Failed to open performance counter for event '{}'", event);
                return Err(CounterError::Unsupported(event));
            }
        };

        let mut group = CounterGroup {
            backend,
            leader_event: events.cycles.clone(),
            leader: Some(leader),
            followers: Vec::with_capacity(4),
            enabled: false,
        };

        for event in events.followers() {
            let opened = match group.leader.as_ref() {
                Some(leader) => group.backend.open(event, Some(leader)),
                None => OpenOutcome::Unsupported(event.to_string()),
            };
            match opened {
                OpenOutcome::Opened(handle) => group.followers.push((event.to_string(), handle)),
                OpenOutcome::Unsupported(event) => {
                    error!("Failed to open performance counter for event '{}'", event);
                    // dropping `group` closes what was opened
                    return Err(CounterError::Unsupported(event));
                }
            }
        }

        debug!("Opened counter group led by '{}'", group.leader_event);
        Ok(group)
    }

    /// Enable the leader, which starts the whole group
    pub fn enable(&mut self) -> Result<(), CounterError> {
        if let Some(leader) = self.leader.as_ref() {
            self.backend.enable(leader).map_err(|e| CounterError::Enable {
                event: self.leader_event.clone(),
                reason: e.to_string(),
            })?;
            self.enabled = true;
        }
        Ok(())
    }

    #[inline(always)]
    pub fn read_cycles(&mut self) -> Result<u64, CounterError> {
        match self.leader.as_ref() {
            Some(leader) => read_counter(&mut *self.backend, &self.leader_event, leader),
            None => Ok(0),
        }
    }

    /// Read the miss counters in open order: L1D, L2, L3, TLB
    #[inline(always)]
    pub fn read_misses(&mut self) -> Result<MissCounts, CounterError> {
        let mut counts = [0u64; 4];
        for (count, (event, handle)) in counts.iter_mut().zip(self.followers.iter()) {
            *count = read_counter(&mut *self.backend, event, handle)?;
        }
        let [l1d, l2, l3, tlb] = counts;
        Ok(MissCounts { l1d, l2, l3, tlb })
    }

    /// Read the miss counters in reverse order: TLB, L3, L2, L1D
    #[inline(always)]
    pub fn read_misses_reversed(&mut self) -> Result<MissCounts, CounterError> {
        let mut counts = [0u64; 4];
        for (count, (event, handle)) in counts.iter_mut().zip(self.followers.iter()).rev() {
            *count = read_counter(&mut *self.backend, event, handle)?;
        }
        let [l1d, l2, l3, tlb] = counts;
        Ok(MissCounts { l1d, l2, l3, tlb })
    }
}

#[inline(always)]
fn read_counter<B: CounterBackend>(
    backend: &mut B,
    event: &str,
    handle: &B::Handle,
) -> Result<u64, CounterError> {
    backend.read(handle).map_err(|e| CounterError::Read {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

impl<B: CounterBackend> Drop for CounterGroup<'_, B> {
    fn drop(&mut self) {
        if self.enabled {
            if let Some(leader) = self.leader.as_ref() {
                if let Err(e) = self.backend.disable(leader) {
                    warn!("Failed to disable counter group led by '{}': {}", self.leader_event, e);
                }
            }
        }
        while let Some((_, follower)) = self.followers.pop() {
            self.backend.close(follower);
        }
        if let Some(leader) = self.leader.take() {
            self.backend.close(leader);
        }
    }
}

/// One counter opened through `perf_event_open`
#[derive(Debug)]
pub struct PerfCounter {
    file: File,
    event: String,
}

/// Linux `perf_event_open` backend counting user-space events of the calling thread on any CPU
#[derive(Debug, Default)]
pub struct PerfEventBackend;

impl CounterBackend for PerfEventBackend {
    type Handle = PerfCounter;

    fn open(&mut self, event: &str, leader: Option<&PerfCounter>) -> OpenOutcome<PerfCounter> {
        let Some(spec) = events::resolve(event) else {
            warn!("Unknown performance counter event '{}'", event);
            return OpenOutcome::Unsupported(event.to_string());
        };
        match sys::open(&spec, leader.map(|l| &l.file)) {
            Ok(file) => OpenOutcome::Opened(PerfCounter {
                file,
                event: event.to_string(),
            }),
            Err(e) => {
                debug!("perf_event_open('{}') failed: {}", event, e);
                OpenOutcome::Unsupported(event.to_string())
            }
        }
    }

    fn enable(&mut self, handle: &PerfCounter) -> io::Result<()> {
        sys::reset_and_enable(&handle.file)
    }

    fn disable(&mut self, handle: &PerfCounter) -> io::Result<()> {
        sys::disable(&handle.file)
    }

    #[inline(always)]
    fn read(&mut self, handle: &PerfCounter) -> io::Result<u64> {
        let mut value = [0u8; 8];
        (&handle.file).read_exact(&mut value)?;
        Ok(u64::from_ne_bytes(value))
    }

    fn close(&mut self, handle: PerfCounter) {
        debug!("Closing counter '{}'", handle.event);
        drop(handle);
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use crate::events::EventSpec;
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    /// Leading fields of the kernel's `struct perf_event_attr` (PERF_ATTR_SIZE_VER1)
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period_or_freq: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events: u32,
        bp_type: u32,
        config1: u64,
        config2: u64,
    }

    const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
    const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
    const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;

    const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

    // _IO('$', nr)
    const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
    const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
    const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
    const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;

    pub fn open(spec: &EventSpec, leader: Option<&File>) -> io::Result<File> {
        let mut flags = PERF_ATTR_FLAG_EXCLUDE_KERNEL | PERF_ATTR_FLAG_EXCLUDE_HV;
        if leader.is_none() {
            // the leader starts disabled; followers count whenever the leader does
            flags |= PERF_ATTR_FLAG_DISABLED;
        }
        let attr = PerfEventAttr {
            type_: spec.type_,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config: spec.config,
            sample_period_or_freq: 0,
            sample_type: 0,
            read_format: 0,
            flags,
            wakeup_events: 0,
            bp_type: 0,
            config1: spec.config1,
            config2: spec.config2,
        };
        let group_fd = leader.map_or(-1, |l| l.as_raw_fd());

        // SAFETY: `attr` is a valid, fully initialized perf_event_attr prefix whose `size` field
        // matches its layout.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                0 as libc::pid_t,
                -1 as libc::c_int,
                group_fd as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the syscall returned a fresh file descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) };
        Ok(File::from(fd))
    }

    fn ioctl(file: &File, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
        // SAFETY: perf ioctls take an integer argument and only act on the given descriptor.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn reset_and_enable(leader: &File) -> io::Result<()> {
        ioctl(leader, PERF_EVENT_IOC_RESET, PERF_IOC_FLAG_GROUP)?;
        ioctl(leader, PERF_EVENT_IOC_ENABLE, PERF_IOC_FLAG_GROUP)
    }

    pub fn disable(leader: &File) -> io::Result<()> {
        ioctl(leader, PERF_EVENT_IOC_DISABLE, PERF_IOC_FLAG_GROUP)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use crate::events::EventSpec;
    use std::fs::File;
    use std::io;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "perf_event_open is only available on Linux")
    }

    pub fn open(_spec: &EventSpec, _leader: Option<&File>) -> io::Result<File> {
        Err(unsupported())
    }

    pub fn reset_and_enable(_leader: &File) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn disable(_leader: &File) -> io::Result<()> {
        Err(unsupported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Backend that records every call, refuses events listed in `unsupported` and fails reads of
    /// events listed in `unreadable`
    #[derive(Default)]
    struct RecordingBackend {
        unsupported: Vec<String>,
        unreadable: Vec<String>,
        log: Rc<RefCell<Vec<String>>>,
        next_id: usize,
    }

    impl CounterBackend for RecordingBackend {
        type Handle = (usize, String);

        fn open(&mut self, event: &str, leader: Option<&Self::Handle>) -> OpenOutcome<Self::Handle> {
            if self.unsupported.iter().any(|e| e == event) {
                return OpenOutcome::Unsupported(event.to_string());
            }
            let id = self.next_id;
            self.next_id += 1;
            let group = leader.map_or("-".to_string(), |l| l.0.to_string());
            self.log.borrow_mut().push(format!("open {id} {event} group={group}"));
            OpenOutcome::Opened((id, event.to_string()))
        }

        fn enable(&mut self, handle: &Self::Handle) -> io::Result<()> {
            self.log.borrow_mut().push(format!("enable {}", handle.0));
            Ok(())
        }

        fn disable(&mut self, handle: &Self::Handle) -> io::Result<()> {
            self.log.borrow_mut().push(format!("disable {}", handle.0));
            Ok(())
        }

        fn read(&mut self, handle: &Self::Handle) -> io::Result<u64> {
            self.log.borrow_mut().push(format!("read {}", handle.0));
            if self.unreadable.contains(&handle.1) {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            Ok(handle.0 as u64 * 100)
        }

        fn close(&mut self, handle: Self::Handle) {
            self.log.borrow_mut().push(format!("close {}", handle.0));
        }
    }

    fn distinct_events() -> EventSet {
        EventSet {
            cycles: "cycles".into(),
            l1d_miss: "l1d".into(),
            l2_miss: "l2".into(),
            l3_miss: "l3".into(),
            tlb_miss: "tlb".into(),
        }
    }

    #[test]
    fn followers_join_leader_group() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = RecordingBackend {
            log: log.clone(),
            ..Default::default()
        };
        drop(CounterGroup::open(&mut backend, &distinct_events()).unwrap());

        let log = log.borrow();
        assert_eq!(log[0], "open 0 cycles group=-");
        assert_eq!(log[1], "open 1 l1d group=0");
        assert_eq!(log[4], "open 4 tlb group=0");
    }

    #[test]
    fn closes_in_reverse_order_after_disable() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = RecordingBackend {
            log: log.clone(),
            ..Default::default()
        };
        let mut group = CounterGroup::open(&mut backend, &distinct_events()).unwrap();
        group.enable().unwrap();
        drop(group);

        let log = log.borrow();
        assert_eq!(
            log[5..],
            ["enable 0", "disable 0", "close 4", "close 3", "close 2", "close 1", "close 0"]
        );
    }

    #[test]
    fn partial_open_failure_closes_opened_counters() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = RecordingBackend {
            unsupported: vec!["l3".into()],
            log: log.clone(),
            ..Default::default()
        };
        let err = CounterGroup::open(&mut backend, &distinct_events()).err();
        assert_eq!(err, Some(CounterError::Unsupported("l3".into())));

        let log = log.borrow();
        assert_eq!(log[3..], ["close 2", "close 1", "close 0"]);
    }

    #[test]
    fn leader_failure_opens_nothing() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = RecordingBackend {
            unsupported: vec!["cycles".into()],
            log: log.clone(),
            ..Default::default()
        };
        assert!(CounterGroup::open(&mut backend, &distinct_events()).is_err());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn miss_read_orders() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = RecordingBackend {
            log: log.clone(),
            ..Default::default()
        };
        let mut group = CounterGroup::open(&mut backend, &distinct_events()).unwrap();
        let forward = group.read_misses().unwrap();
        let reversed = group.read_misses_reversed().unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(
            forward,
            MissCounts {
                l1d: 100,
                l2: 200,
                l3: 300,
                tlb: 400
            }
        );
        drop(group);

        let log = log.borrow();
        assert_eq!(
            log[5..13],
            ["read 1", "read 2", "read 3", "read 4", "read 4", "read 3", "read 2", "read 1"]
        );
    }

    #[test]
    fn failed_read_names_the_event() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut backend = RecordingBackend {
            unreadable: vec!["l2".into()],
            log: log.clone(),
            ..Default::default()
        };
        let mut group = CounterGroup::open(&mut backend, &distinct_events()).unwrap();
        assert_eq!(group.read_cycles(), Ok(0));
        let err = group.read_misses().unwrap_err();
        assert!(matches!(err, CounterError::Read { ref event, .. } if event == "l2"));
        drop(group);

        // the read stops at the failing counter
        let log = log.borrow();
        assert_eq!(log[5..8], ["read 0", "read 1", "read 2"]);
        assert_eq!(log[8], "close 4");
    }

    #[test]
    fn miss_deltas_wrap() {
        let start = MissCounts {
            l1d: u64::MAX,
            l2: 5,
            l3: 0,
            tlb: 10,
        };
        let end = MissCounts {
            l1d: 1,
            l2: 7,
            l3: 0,
            tlb: 15,
        };
        assert_eq!(
            end.since(&start),
            MissCounts {
                l1d: 2,
                l2: 2,
                l3: 0,
                tlb: 5
            }
        );
    }

    #[test]
    fn unknown_event_is_unsupported() {
        let mut backend = PerfEventBackend;
        match backend.open("NOT-A-REAL-EVENT", None) {
            OpenOutcome::Unsupported(event) => assert_eq!(event, "NOT-A-REAL-EVENT"),
            OpenOutcome::Opened(_) => panic!("unknown event opened"),
        }
    }
}
