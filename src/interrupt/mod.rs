//! Trap vector table and dispatcher.
//!
//! Every trap funnels through [`InterruptTable::dispatch`] with a
//! [`Trapframe`] built by the entry trampoline. The raw cause is folded
//! into a dense 256-entry vector table shared by three families:
//!
//! - synchronous exceptions keep their cause value as the index,
//! - external interrupts (claimed from the PLIC) land in the upper half at
//!   `irq + 128`,
//! - the remaining asynchronous causes ("software" vectors: timer and
//!   software interrupts) are numbered from the top down at `255 - cause`.
//!
//! The reversed numbering of the software region is long-standing and the
//! resulting indices are relied on elsewhere, so it is preserved as is.
//!
//! External interrupts are special: they run with interrupts off for the
//! whole of dispatch, never nest, and their handlers must not block. A
//! handler may request a deferred reschedule through
//! [`IntrContext::yield_on_return`], which dispatch honors after the PLIC
//! handshake completes.

pub mod plic;
mod trapframe;

pub use trapframe::Trapframe;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::Hal;
use plic::Plic;

/// Number of vector table entries.
pub const INTR_CNT: usize = 256;

/// Interrupt status a handler is registered to run with. `Off` marks the
/// handler as external: it is claimed from the PLIC and runs with
/// interrupts masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    On,
    Off,
}

/// A registered trap handler.
///
/// External handlers run in interrupt context: interrupts are off, the
/// handler cannot nest and must not block. Requesting a reschedule goes
/// through [`IntrContext::yield_on_return`] instead of yielding directly.
pub trait InterruptHandler: Send {
    fn handle(&mut self, frame: &mut Trapframe, intr: &IntrContext);
}

/// Dispatch-context flags shared with handlers.
///
/// Single-hart: these are only ever flipped by the one dispatch in
/// flight, so relaxed atomics are enough; the atomics exist for interior
/// mutability, not cross-CPU ordering.
pub struct IntrContext {
    in_external: AtomicBool,
    yield_requested: AtomicBool,
}

impl IntrContext {
    const fn new() -> Self {
        Self {
            in_external: AtomicBool::new(false),
            yield_requested: AtomicBool::new(false),
        }
    }

    /// True while an external interrupt is being dispatched.
    pub fn in_external(&self) -> bool {
        self.in_external.load(Ordering::Relaxed)
    }

    /// Ask dispatch to yield to the scheduler just before returning from
    /// the current external interrupt.
    ///
    /// # Panics
    ///
    /// Panics when called outside an active external interrupt context.
    pub fn yield_on_return(&self) {
        assert!(
            self.in_external(),
            "yield_on_return called outside external interrupt context"
        );
        self.yield_requested.store(true, Ordering::Relaxed);
    }

    fn enter(&self) {
        self.in_external.store(true, Ordering::Relaxed);
        self.yield_requested.store(false, Ordering::Relaxed);
    }

    fn leave(&self) -> bool {
        self.in_external.store(false, Ordering::Relaxed);
        self.yield_requested.swap(false, Ordering::Relaxed)
    }
}

/// Per-vector counter for traps that arrive without a registered handler.
///
/// The decision to log is rate limited: only counts that are powers of
/// two report, so an interrupt storm cannot flood the console but a rare
/// stray still shows up immediately.
#[derive(Default)]
pub struct UnexpectedCounter {
    count: u32,
}

impl UnexpectedCounter {
    /// Record one unexpected trap. Returns whether this occurrence should
    /// be logged.
    pub fn record(&mut self) -> bool {
        self.count += 1;
        self.count & (self.count - 1) == 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

struct Vector {
    name: &'static str,
    handler: Box<dyn InterruptHandler>,
}

/// Fold a raw vector number into its table index.
///
/// External interrupts occupy the upper half, software vectors are
/// numbered from the top down, exceptions keep their own number. The
/// three regions never collide for the vector ranges in use (sources
/// below 64, causes below 64).
pub fn fold_vector(vec_no: u8, exception: bool, external: bool) -> usize {
    if external {
        vec_no as usize + INTR_CNT / 2
    } else if !exception {
        INTR_CNT - vec_no as usize - 1
    } else {
        vec_no as usize
    }
}

/// Whether a raw cause is an external interrupt: asynchronous, with the
/// low nibble in the platform's external range (8..=11 covers user
/// through machine external interrupt causes).
pub fn is_external_cause(cause: isize) -> bool {
    cause < 0 && (8..=11).contains(&(cause & 0xf))
}

/// The vector table: registration at boot, dispatch forever after.
///
/// Owned by whoever wires up the kernel and passed by reference to the
/// trap entry path; there is deliberately no global instance here.
pub struct InterruptTable {
    slots: [Option<Vector>; INTR_CNT],
    unexpected: [UnexpectedCounter; INTR_CNT],
    context: IntrContext,
    plic: Plic,
}

impl InterruptTable {
    /// Build the table and initialize the PLIC it claims from.
    pub fn new(plic: Plic) -> Self {
        plic.init();
        Self {
            slots: core::array::from_fn(|_| None),
            unexpected: core::array::from_fn(|_| UnexpectedCounter::default()),
            context: IntrContext::new(),
            plic,
        }
    }

    /// Register `handler` for vector `vec_no`.
    ///
    /// `exception` selects identity folding; `level == Off` marks the
    /// handler external and additionally enables its source in the PLIC
    /// at priority 1.
    ///
    /// # Panics
    ///
    /// Panics if the folded slot is already occupied; one handler per
    /// vector is a hard rule and re-registration is a programming error.
    pub fn register(
        &mut self,
        vec_no: u8,
        exception: bool,
        level: IntrLevel,
        handler: Box<dyn InterruptHandler>,
        name: &'static str,
    ) {
        let external = level == IntrLevel::Off;
        let index = fold_vector(vec_no, exception, external);
        assert!(
            self.slots[index].is_none(),
            "vector {:#04x} ({}) registered twice",
            index,
            name
        );

        if external {
            self.plic.register(vec_no as u32, 1);
        }

        self.slots[index] = Some(Vector { name, handler });
        log::debug!("registered {} at vector {:#04x}", name, index);
    }

    /// Register an external interrupt handler for PLIC source `irq`.
    pub fn register_external(
        &mut self,
        irq: u8,
        handler: Box<dyn InterruptHandler>,
        name: &'static str,
    ) {
        self.register(irq, false, IntrLevel::Off, handler, name);
    }

    /// Route one trap to its handler.
    ///
    /// For external interrupts this performs the full claim/complete
    /// handshake and enforces the context rules: interrupts stay off, no
    /// nesting, deferred yield honored on the way out. Synchronous and
    /// software traps are folded and invoked directly.
    pub fn dispatch(&mut self, hal: &dyn Hal, frame: &mut Trapframe) {
        let external = is_external_cause(frame.cause);
        let mut claimed = 0u32;

        if external {
            assert!(
                !hal.interrupts_enabled(),
                "external interrupt with interrupts enabled"
            );
            assert!(!self.context.in_external(), "external interrupt nested");
            self.context.enter();
            claimed = self.plic.claim();
        }

        let index = if external {
            fold_vector(claimed as u8, false, true)
        } else {
            let vec_no = (frame.cause as usize & (isize::MAX as usize)) as u8;
            fold_vector(vec_no, frame.cause >= 0, false)
        };

        match self.slots[index].as_mut() {
            Some(vector) => vector.handler.handle(frame, &self.context),
            None => {
                if self.unexpected[index].record() {
                    log::warn!(
                        "unexpected interrupt {:#04x} (unknown), cause {:#x}",
                        index,
                        frame.cause
                    );
                }
            }
        }

        if external {
            assert!(
                !hal.interrupts_enabled(),
                "external handler re-enabled interrupts"
            );
            let wants_yield = self.context.leave();
            self.plic.complete(claimed);
            if wants_yield {
                hal.yield_now();
            }
        }
    }

    /// True during processing of an external interrupt.
    pub fn in_external(&self) -> bool {
        self.context.in_external()
    }

    /// Name registered for a table index, for diagnostics.
    pub fn name(&self, index: usize) -> &'static str {
        self.slots
            .get(index)
            .and_then(|s| s.as_ref())
            .map_or("unknown", |v| v.name)
    }

    /// How many unexpected traps have hit a table index.
    pub fn unexpected_count(&self, index: usize) -> u32 {
        self.unexpected[index].count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Completion;
    use crate::mmio::MmioBus;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, AtomicUsize};
    use spin::Mutex;

    struct TestHal {
        yields: AtomicU32,
    }

    impl TestHal {
        fn new() -> Self {
            Self {
                yields: AtomicU32::new(0),
            }
        }
    }

    impl Hal for TestHal {
        fn dma_alloc_pages(&self, _count: usize) -> usize {
            unreachable!()
        }
        fn virt_to_phys(&self, vaddr: usize) -> u64 {
            vaddr as u64
        }
        fn sleep_ms(&self, _ms: u64) {}
        fn yield_now(&self) {
            self.yields.fetch_add(1, Ordering::Relaxed);
        }
        fn interrupts_enabled(&self) -> bool {
            false
        }
        fn make_completion(&self) -> Arc<dyn Completion> {
            unreachable!()
        }
    }

    /// Claim/complete-only PLIC model; the register programming side is
    /// covered by the plic module's own tests.
    struct StubPlicBus {
        claim_value: AtomicU32,
        completed: Mutex<Vec<u32>>,
    }

    impl StubPlicBus {
        fn new(claim_value: u32) -> Self {
            Self {
                claim_value: AtomicU32::new(claim_value),
                completed: Mutex::new(Vec::new()),
            }
        }
    }

    impl MmioBus for StubPlicBus {
        fn read32(&self, offset: usize) -> u32 {
            if offset == 0x0020_1004 {
                self.claim_value.load(Ordering::Relaxed)
            } else {
                0
            }
        }
        fn write32(&self, offset: usize, value: u32) {
            if offset == 0x0020_1004 {
                self.completed.lock().push(value);
            }
        }
    }

    struct CountingHandler {
        hits: Arc<AtomicUsize>,
        request_yield: bool,
    }

    impl InterruptHandler for CountingHandler {
        fn handle(&mut self, _frame: &mut Trapframe, intr: &IntrContext) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if self.request_yield {
                intr.yield_on_return();
            }
        }
    }

    fn table_with_claim(claim: u32) -> (InterruptTable, Arc<StubPlicBus>) {
        let bus = Arc::new(StubPlicBus::new(claim));
        let table = InterruptTable::new(Plic::new(bus.clone()));
        (table, bus)
    }

    fn counting_handler(request_yield: bool) -> (Box<CountingHandler>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountingHandler {
                hits: hits.clone(),
                request_yield,
            }),
            hits,
        )
    }

    #[test]
    fn folding_matches_the_three_regions() {
        assert_eq!(fold_vector(3, false, true), 131);
        assert_eq!(fold_vector(5, false, false), 250);
        assert_eq!(fold_vector(13, true, false), 13);
    }

    #[test]
    fn folding_is_injective_across_boot_vectors() {
        let mut seen = [false; INTR_CNT];
        // Exceptions 0..16, software vectors 0..8, external sources 0..64:
        // the ranges the kernel actually registers at boot.
        for v in 0..16u8 {
            let i = fold_vector(v, true, false);
            assert!(!seen[i], "collision at {}", i);
            seen[i] = true;
        }
        for v in 0..8u8 {
            let i = fold_vector(v, false, false);
            assert!(!seen[i], "collision at {}", i);
            seen[i] = true;
        }
        for v in 0..64u8 {
            let i = fold_vector(v, false, true);
            assert!(!seen[i], "collision at {}", i);
            seen[i] = true;
        }
    }

    #[test]
    fn distinct_vectors_register_fine() {
        let (mut table, _) = table_with_claim(0);
        let (h1, _) = counting_handler(false);
        let (h2, _) = counting_handler(false);
        table.register(13, true, IntrLevel::On, h1, "#PF Load Page Fault");
        table.register(13, false, IntrLevel::Off, h2, "disk");
        assert_eq!(table.name(13), "#PF Load Page Fault");
        assert_eq!(table.name(141), "disk");
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_vector_registration_panics() {
        let (mut table, _) = table_with_claim(0);
        let (h1, _) = counting_handler(false);
        let (h2, _) = counting_handler(false);
        table.register(13, true, IntrLevel::On, h1, "first");
        table.register(13, true, IntrLevel::On, h2, "second");
    }

    #[test]
    fn synchronous_exception_routes_by_identity() {
        let (mut table, _) = table_with_claim(0);
        let (handler, hits) = counting_handler(false);
        table.register(13, true, IntrLevel::On, handler, "#PF Load Page Fault");

        let hal = TestHal::new();
        let mut frame = Trapframe::with_cause(13);
        table.dispatch(&hal, &mut frame);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!table.in_external());
    }

    #[test]
    fn software_interrupt_routes_reversed() {
        let (mut table, _) = table_with_claim(0);
        let (handler, hits) = counting_handler(false);
        table.register(5, false, IntrLevel::On, handler, "Supervisor Timer");

        let hal = TestHal::new();
        // Asynchronous cause 5: negative, low nibble outside 8..=11.
        let mut frame = Trapframe::with_cause(isize::MIN | 5);
        table.dispatch(&hal, &mut frame);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn external_interrupt_claims_dispatches_and_completes() {
        let (mut table, bus) = table_with_claim(2);
        let (handler, hits) = counting_handler(false);
        table.register_external(2, handler, "disk");

        let hal = TestHal::new();
        let mut frame = Trapframe::with_cause(isize::MIN | 9);
        table.dispatch(&hal, &mut frame);

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(*bus.completed.lock(), alloc::vec![2]);
        assert!(!table.in_external());
        assert_eq!(hal.yields.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn deferred_yield_runs_after_completion() {
        let (mut table, bus) = table_with_claim(2);
        let (handler, _) = counting_handler(true);
        table.register_external(2, handler, "disk");

        let hal = TestHal::new();
        let mut frame = Trapframe::with_cause(isize::MIN | 9);
        table.dispatch(&hal, &mut frame);
        assert_eq!(hal.yields.load(Ordering::Relaxed), 1);
        assert_eq!(*bus.completed.lock(), alloc::vec![2]);
    }

    #[test]
    #[should_panic(expected = "outside external interrupt context")]
    fn yield_on_return_outside_dispatch_panics() {
        let ctx = IntrContext::new();
        ctx.yield_on_return();
    }

    #[test]
    fn unexpected_interrupts_are_counted_and_rate_limited() {
        let (mut table, _) = table_with_claim(7);
        let hal = TestHal::new();

        let mut logged_at = Vec::new();
        for _ in 0..20 {
            let mut frame = Trapframe::with_cause(isize::MIN | 9);
            table.dispatch(&hal, &mut frame);
            let index = fold_vector(7, false, true);
            // Mirror the dispatcher's decision through the counter value.
            let n = table.unexpected_count(index);
            if n & (n - 1) == 0 {
                logged_at.push(n);
            }
        }

        let index = fold_vector(7, false, true);
        assert_eq!(table.unexpected_count(index), 20);
        assert_eq!(logged_at, alloc::vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn counter_reports_log_worthy_counts_exactly_at_powers_of_two() {
        let mut counter = UnexpectedCounter::default();
        let mut logged = Vec::new();
        for _ in 0..20 {
            if counter.record() {
                logged.push(counter.count());
            }
        }
        assert_eq!(logged, alloc::vec![1, 2, 4, 8, 16]);
    }
}
