//! Static-mode runtime collaborator.
//!
//! The interpreter does not own the object model, the reference-counting
//! allocator or class initialisation; it reaches them through
//! [`StaticRuntime`]. [`SimpleRuntime`] is a self-contained implementation
//! used by the command-line runner and the tests: objects are real heap
//! blocks whose first word is the class id, and every count change is
//! recorded so callers can check conservation.

use std::collections::HashMap;
use std::sync::Mutex;

/// Exceptions the interpreter raises on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinException {
    NullPointer,
    Arithmetic,
    NoClassDefFound,
    ExceptionInInitializer,
}

/// Initialisation state of a class as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassInitState {
    Uninitialized,
    Initializing,
    Failure,
    Initialized,
}

/// Outcome recorded for one class initializer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClinitStatus {
    Normal = 0,
    Skipped = 1,
    Thrown = 2,
}

/// One initializer to run, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClinitStep {
    /// Class being initialised; 0 when unknown.
    pub class: u64,
    /// Initializer entry point; 0 when the class has none.
    pub clinit: u64,
}

/// Upper bound on the initializer chain of one class.
pub const MAX_CLINIT_CHAIN: usize = 128;

pub trait StaticRuntime: Send + Sync {
    fn inc_ref(&self, obj: u64);
    fn dec_ref(&self, obj: u64);

    /// Run-time instance-of check of `obj` against `class`, the class word
    /// a catch table points at.
    fn instance_of(&self, obj: u64, class: u64) -> bool;

    /// True when `obj` is an instance of the error branch of the
    /// hierarchy (rethrown unchanged out of initializers).
    fn is_error(&self, obj: u64) -> bool;

    fn new_exception(&self, kind: BuiltinException) -> u64;

    /// Initializers needed before `classinfo` may be used.
    fn prepare_clinit(&self, classinfo: u64) -> Vec<ClinitStep>;

    fn class_init_state(&self, class: u64) -> ClassInitState;

    fn finalize_clinit(&self, class: u64, status: ClinitStatus);

    fn enter_saferegion(&self) {}

    fn leave_saferegion(&self) {}

    /// Called after an allocation intrinsic returned `obj`.
    fn on_new_object(&self, _obj: u64) {}
}

// ============================================================
// SimpleRuntime
// ============================================================

/// Class ids of the builtin hierarchy in [`SimpleRuntime`].
pub mod class_id {
    pub const THROWABLE: u64 = 0x100;
    pub const EXCEPTION: u64 = 0x101;
    pub const ERROR: u64 = 0x102;
    pub const RUNTIME_EXCEPTION: u64 = 0x103;
    pub const NULL_POINTER: u64 = 0x104;
    pub const ARITHMETIC: u64 = 0x105;
    pub const LINKAGE_ERROR: u64 = 0x106;
    pub const NO_CLASS_DEF_FOUND: u64 = 0x107;
    pub const EXCEPTION_IN_INITIALIZER: u64 = 0x108;
}

#[derive(Default)]
struct State {
    /// class id -> parent class id
    classes: HashMap<u64, u64>,
    /// object address -> owned block (class word first)
    objects: HashMap<u64, Box<[u64; 2]>>,
    /// reference-count deltas per address
    counts: HashMap<u64, i64>,
    clinits: HashMap<u64, Vec<ClinitStep>>,
    init_states: HashMap<u64, ClassInitState>,
    finalized: Vec<(u64, ClinitStatus)>,
    saferegion_depth: i32,
    allocations: Vec<u64>,
}

/// Self-contained [`StaticRuntime`].
pub struct SimpleRuntime {
    state: Mutex<State>,
}

impl Default for SimpleRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleRuntime {
    pub fn new() -> Self {
        use class_id::*;
        let rt = SimpleRuntime {
            state: Mutex::new(State::default()),
        };
        for (class, parent) in [
            (THROWABLE, 0),
            (EXCEPTION, THROWABLE),
            (ERROR, THROWABLE),
            (RUNTIME_EXCEPTION, EXCEPTION),
            (NULL_POINTER, RUNTIME_EXCEPTION),
            (ARITHMETIC, RUNTIME_EXCEPTION),
            (LINKAGE_ERROR, ERROR),
            (NO_CLASS_DEF_FOUND, LINKAGE_ERROR),
            (EXCEPTION_IN_INITIALIZER, LINKAGE_ERROR),
        ] {
            rt.define_class(class, parent);
        }
        rt
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // a poisoned lock only means another test thread panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn define_class(&self, class: u64, parent: u64) {
        self.state().classes.insert(class, parent);
    }

    /// Allocates an object of `class`; returns its address.
    pub fn new_object(&self, class: u64) -> u64 {
        let block = Box::new([class, 0]);
        let addr = block.as_ptr() as u64;
        let mut state = self.state();
        state.objects.insert(addr, block);
        state.allocations.push(addr);
        addr
    }

    pub fn class_of(&self, obj: u64) -> Option<u64> {
        self.state().objects.get(&obj).map(|b| b[0])
    }

    /// Net reference-count change recorded for `obj`.
    pub fn ref_delta(&self, obj: u64) -> i64 {
        self.state().counts.get(&obj).copied().unwrap_or(0)
    }

    pub fn set_clinit_chain(&self, classinfo: u64, steps: Vec<ClinitStep>) {
        self.state().clinits.insert(classinfo, steps);
    }

    pub fn set_init_state(&self, class: u64, state: ClassInitState) {
        self.state().init_states.insert(class, state);
    }

    /// Every `finalize_clinit` call so far, in order.
    pub fn finalized(&self) -> Vec<(u64, ClinitStatus)> {
        self.state().finalized.clone()
    }

    pub fn saferegion_depth(&self) -> i32 {
        self.state().saferegion_depth
    }

    /// Objects announced through `on_new_object`.
    pub fn announced(&self) -> Vec<u64> {
        self.state().allocations.clone()
    }

    fn is_subclass(state: &State, mut class: u64, ancestor: u64) -> bool {
        for _ in 0..64 {
            if class == ancestor {
                return true;
            }
            match state.classes.get(&class) {
                Some(&parent) if parent != 0 => class = parent,
                _ => return false,
            }
        }
        false
    }
}

impl StaticRuntime for SimpleRuntime {
    fn inc_ref(&self, obj: u64) {
        *self.state().counts.entry(obj).or_insert(0) += 1;
    }

    fn dec_ref(&self, obj: u64) {
        *self.state().counts.entry(obj).or_insert(0) -= 1;
    }

    fn instance_of(&self, obj: u64, class: u64) -> bool {
        let state = self.state();
        match state.objects.get(&obj) {
            Some(block) => Self::is_subclass(&state, block[0], class),
            None => false,
        }
    }

    fn is_error(&self, obj: u64) -> bool {
        let state = self.state();
        match state.objects.get(&obj) {
            Some(block) => Self::is_subclass(&state, block[0], class_id::ERROR),
            None => false,
        }
    }

    fn new_exception(&self, kind: BuiltinException) -> u64 {
        let class = match kind {
            BuiltinException::NullPointer => class_id::NULL_POINTER,
            BuiltinException::Arithmetic => class_id::ARITHMETIC,
            BuiltinException::NoClassDefFound => class_id::NO_CLASS_DEF_FOUND,
            BuiltinException::ExceptionInInitializer => class_id::EXCEPTION_IN_INITIALIZER,
        };
        self.new_object(class)
    }

    fn prepare_clinit(&self, classinfo: u64) -> Vec<ClinitStep> {
        let mut steps = self.state().clinits.get(&classinfo).cloned().unwrap_or_default();
        steps.truncate(MAX_CLINIT_CHAIN);
        steps
    }

    fn class_init_state(&self, class: u64) -> ClassInitState {
        self.state()
            .init_states
            .get(&class)
            .copied()
            .unwrap_or(ClassInitState::Uninitialized)
    }

    fn finalize_clinit(&self, class: u64, status: ClinitStatus) {
        let mut state = self.state();
        state.finalized.push((class, status));
        let next = match status {
            ClinitStatus::Normal => ClassInitState::Initialized,
            ClinitStatus::Skipped => ClassInitState::Uninitialized,
            ClinitStatus::Thrown => ClassInitState::Failure,
        };
        state.init_states.insert(class, next);
    }

    fn enter_saferegion(&self) {
        self.state().saferegion_depth += 1;
    }

    fn leave_saferegion(&self) {
        self.state().saferegion_depth -= 1;
    }

    fn on_new_object(&self, obj: u64) {
        self.state().allocations.push(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy() {
        let rt = SimpleRuntime::new();
        let npe = rt.new_exception(BuiltinException::NullPointer);
        assert!(rt.instance_of(npe, class_id::RUNTIME_EXCEPTION));
        assert!(!rt.instance_of(npe, class_id::ERROR));
        assert!(!rt.is_error(npe));
        let ncdf = rt.new_exception(BuiltinException::NoClassDefFound);
        assert!(rt.is_error(ncdf));
    }

    #[test]
    fn test_ref_deltas() {
        let rt = SimpleRuntime::new();
        let obj = rt.new_object(class_id::EXCEPTION);
        rt.inc_ref(obj);
        rt.inc_ref(obj);
        rt.dec_ref(obj);
        assert_eq!(rt.ref_delta(obj), 1);
        assert_eq!(rt.class_of(obj), Some(class_id::EXCEPTION));
    }

    #[test]
    fn test_finalize_updates_state() {
        let rt = SimpleRuntime::new();
        rt.finalize_clinit(0x500, ClinitStatus::Thrown);
        assert_eq!(rt.class_init_state(0x500), ClassInitState::Failure);
        assert_eq!(rt.finalized(), vec![(0x500, ClinitStatus::Thrown)]);
    }
}
