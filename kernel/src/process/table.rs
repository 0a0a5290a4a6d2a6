//! Process table.
//!
//! A fixed arena of PCB slots. References between processes are PIDs, never
//! pointers, so the table can be reasoned about (and tested) as plain data.

use super::pcb::{Pcb, Pid, ProcessState, IDLE_PID};
use crate::error::{KernelError, KernelResult};

/// Maximum live processes, idle included.
pub const MAX_PROCESSES: usize = 32;

pub struct ProcessTable {
    slots: [Option<Pcb>; MAX_PROCESSES],
    next_pid: Pid,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            next_pid: 1,
        }
    }

    /// Insert a PCB, assigning the next PID. Returns the PID.
    pub fn insert(&mut self, mut pcb: Pcb) -> KernelResult<Pid> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::ProcessLimit)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        pcb.pid = pid;
        self.slots[slot] = Some(pcb);
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots
            .iter()
            .flatten()
            .find(|p| p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.pid == pid)
    }

    /// Round-robin pick: first READY process with a PID after `current`
    /// (wrapping), idle as the permanent fallback.
    pub fn select_next(&self, current: Pid) -> Pid {
        let mut best_after: Option<Pid> = None;
        let mut best_overall: Option<Pid> = None;

        for pcb in self.slots.iter().flatten() {
            if pcb.state != ProcessState::Ready || pcb.pid == IDLE_PID {
                continue;
            }
            if pcb.pid > current {
                best_after = Some(match best_after {
                    Some(b) => b.min(pcb.pid),
                    None => pcb.pid,
                });
            }
            best_overall = Some(match best_overall {
                Some(b) => b.min(pcb.pid),
                None => pcb.pid,
            });
        }

        best_after.or(best_overall).unwrap_or(IDLE_PID)
    }

    /// Remove TERMINATED slots, handing each reaped PCB to `release` so the
    /// caller can return its stack and image.
    pub fn reap(&mut self, mut release: impl FnMut(&Pcb)) {
        for slot in self.slots.iter_mut() {
            if let Some(pcb) = slot {
                if pcb.state == ProcessState::Terminated {
                    release(pcb);
                    *slot = None;
                }
            }
        }
    }

    /// Count of processes in a given state.
    pub fn count_in_state(&self, state: ProcessState) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.state == state)
            .count()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.slots.iter_mut().flatten()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::arch::x86::context::Context;

    fn pcb(state: ProcessState) -> Pcb {
        Pcb {
            pid: 0,
            name: String::from("p"),
            state,
            context: Context { esp: 0, eip: 0 },
            stack_base: 0,
            stack_size: 0,
            image_base: 0,
            image_size: 0,
            exit_code: 0,
        }
    }

    fn table_with(states: &[ProcessState]) -> ProcessTable {
        let mut t = ProcessTable::new();
        for &s in states {
            t.insert(pcb(s)).unwrap();
        }
        t
    }

    #[test]
    fn pids_are_sequential_from_one() {
        let mut t = ProcessTable::new();
        assert_eq!(t.insert(pcb(ProcessState::Ready)).unwrap(), 1);
        assert_eq!(t.insert(pcb(ProcessState::Ready)).unwrap(), 2);
        assert_eq!(t.insert(pcb(ProcessState::Ready)).unwrap(), 3);
    }

    #[test]
    fn round_robin_wraps_past_current() {
        // PIDs 1 (idle), 2, 3, 4 all ready.
        let t = table_with(&[
            ProcessState::Ready,
            ProcessState::Ready,
            ProcessState::Ready,
            ProcessState::Ready,
        ]);
        assert_eq!(t.select_next(2), 3);
        assert_eq!(t.select_next(3), 4);
        assert_eq!(t.select_next(4), 2); // wraps, skipping idle
    }

    #[test]
    fn idle_is_the_fallback_when_nothing_is_ready() {
        let t = table_with(&[
            ProcessState::Ready, // idle (pid 1)
            ProcessState::Blocked,
            ProcessState::Terminated,
        ]);
        assert_eq!(t.select_next(1), IDLE_PID);
        assert_eq!(t.select_next(3), IDLE_PID);
    }

    #[test]
    fn only_idle_ready_means_no_other_choice() {
        let t = table_with(&[ProcessState::Ready]);
        assert_eq!(t.select_next(IDLE_PID), IDLE_PID);
    }

    #[test]
    fn blocked_processes_are_skipped() {
        let t = table_with(&[
            ProcessState::Ready,   // pid 1 idle
            ProcessState::Blocked, // pid 2
            ProcessState::Ready,   // pid 3
        ]);
        assert_eq!(t.select_next(1), 3);
        assert_eq!(t.select_next(3), 3);
    }

    #[test]
    fn reap_clears_terminated_slots_and_reports_them() {
        let mut t = table_with(&[
            ProcessState::Ready,
            ProcessState::Terminated,
            ProcessState::Ready,
            ProcessState::Terminated,
        ]);
        let mut reaped = alloc::vec::Vec::new();
        t.reap(|p| reaped.push(p.pid));
        reaped.sort_unstable();
        assert_eq!(reaped, [2, 4]);
        assert_eq!(t.live_count(), 2);

        // Slots are reusable afterwards.
        for _ in 0..MAX_PROCESSES - 2 {
            t.insert(pcb(ProcessState::Ready)).unwrap();
        }
        assert!(t.insert(pcb(ProcessState::Ready)).is_err());
    }

    #[test]
    fn at_most_one_running_is_callers_invariant_to_check() {
        let mut t = table_with(&[ProcessState::Ready, ProcessState::Ready]);
        t.get_mut(2).unwrap().state = ProcessState::Running;
        assert_eq!(t.count_in_state(ProcessState::Running), 1);
    }
}
