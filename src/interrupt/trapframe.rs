//! Trap frame layout.

/// Snapshot of the interrupted context, built by the trap entry trampoline
/// on every trap and discarded when dispatch returns.
///
/// `cause` carries the raw scause value reinterpreted as signed: the
/// interrupt bit is the sign bit, so asynchronous causes are negative and
/// synchronous ones non-negative. `trap_val` is stval (the faulting
/// address for memory faults) and `status` is sstatus at trap entry.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Trapframe {
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    /// Return address of the trap (sepc).
    pub epc: usize,
    /// Raw scause, signed: negative means asynchronous.
    pub cause: isize,
    /// stval at trap entry.
    pub trap_val: usize,
    /// sstatus at trap entry.
    pub status: usize,
}

impl Trapframe {
    /// A zeroed frame carrying only a cause, mainly useful for driving the
    /// dispatcher from tests and early boot probes.
    pub fn with_cause(cause: isize) -> Self {
        Self {
            cause,
            ..Self::default()
        }
    }

    /// Log the full register snapshot, for debugging a trap that should
    /// not have happened.
    pub fn dump(&self) {
        log::error!(
            "trap at epc={:#x}, cause={:#x}, stval={:#x}, sstatus={:#x}",
            self.epc,
            self.cause,
            self.trap_val,
            self.status
        );
        log::error!(
            " ra={:#x} sp={:#x} gp={:#x} tp={:#x}",
            self.ra,
            self.sp,
            self.gp,
            self.tp
        );
        log::error!(
            " t0={:#x} t1={:#x} t2={:#x} t3={:#x} t4={:#x} t5={:#x} t6={:#x}",
            self.t0,
            self.t1,
            self.t2,
            self.t3,
            self.t4,
            self.t5,
            self.t6
        );
        log::error!(
            " s0={:#x} s1={:#x} s2={:#x} s3={:#x} s4={:#x} s5={:#x}",
            self.s0,
            self.s1,
            self.s2,
            self.s3,
            self.s4,
            self.s5
        );
        log::error!(
            " s6={:#x} s7={:#x} s8={:#x} s9={:#x} s10={:#x} s11={:#x}",
            self.s6,
            self.s7,
            self.s8,
            self.s9,
            self.s10,
            self.s11
        );
        log::error!(
            " a0={:#x} a1={:#x} a2={:#x} a3={:#x} a4={:#x} a5={:#x} a6={:#x} a7={:#x}",
            self.a0,
            self.a1,
            self.a2,
            self.a3,
            self.a4,
            self.a5,
            self.a6,
            self.a7
        );
    }
}
