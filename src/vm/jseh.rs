//! Dynamic-mode exception handlers.
//!
//! Every `jstry` pushes a handler record; the top of the stack is the
//! current handler. A record moves through the stages of its try region
//! (`try`, then `catch` and/or `finally`) while tracking whether a thrown
//! value is pending. Resolving a raised exception never unwinds the native
//! stack: [`EhStack::get_eh_pc`] either names a target inside the asking
//! frame, hands control back to the caller frame, or frees the handler and
//! retries one level out.
//!
//! The stack stores thrown values without touching reference counts.
//! Values it stops holding are queued and collected through
//! [`EhStack::take_released`] by whoever owns the heap.

use tracing::debug;

use crate::error::EngineError;

use super::nanbox::JsValue;

/// Freed records kept for reuse.
const REUSE_POOL: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhStage {
    Try,
    Catch,
    Finally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrownState {
    None,
    Raised,
    Handled,
}

/// One try region.
#[derive(Debug, Clone)]
pub struct JsEh {
    pub try_pc: usize,
    pub catch_pc: Option<usize>,
    pub finally_pc: Option<usize>,
    pub stage: EhStage,
    pub thrown_state: ThrownState,
    pub thrown: JsValue,
    /// Call that owns the region.
    pub frame: u64,
    gosub: Vec<usize>,
}

impl JsEh {
    fn new() -> Self {
        JsEh {
            try_pc: 0,
            catch_pc: None,
            finally_pc: None,
            stage: EhStage::Try,
            thrown_state: ThrownState::None,
            thrown: JsValue::NONE,
            frame: 0,
            gosub: Vec::new(),
        }
    }

    fn init(&mut self, try_pc: usize, catch_pc: Option<usize>, finally_pc: Option<usize>, frame: u64) {
        self.try_pc = try_pc;
        self.catch_pc = catch_pc;
        self.finally_pc = finally_pc;
        self.stage = EhStage::Try;
        self.thrown_state = ThrownState::None;
        self.thrown = JsValue::NONE;
        self.frame = frame;
        self.gosub.clear();
    }

    pub fn is_raised(&self) -> bool {
        self.thrown_state == ThrownState::Raised
    }

    /// The block a raised exception moves to from the current stage.
    fn local_target(&self) -> Option<usize> {
        match self.stage {
            EhStage::Try => self.catch_pc.or(self.finally_pc),
            EhStage::Catch => self.finally_pc,
            EhStage::Finally => None,
        }
    }
}

/// Stage-machine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhEvent {
    Throw,
    Catch,
    Finally,
}

#[derive(Debug, Default)]
pub struct EhStack {
    stack: Vec<JsEh>,
    pool: Vec<JsEh>,
    released: Vec<JsValue>,
    /// The value left over when the last handler was freed with an
    /// exception still raised.
    uncaught: Option<JsValue>,
}

impl EhStack {
    pub fn new() -> Self {
        EhStack::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub fn current(&self) -> Option<&JsEh> {
        self.stack.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut JsEh> {
        self.stack.last_mut()
    }

    /// Enters a try region owned by `frame`.
    pub fn enter(&mut self, try_pc: usize, catch_pc: Option<usize>, finally_pc: Option<usize>, frame: u64) {
        let mut eh = self.pool.pop().unwrap_or_else(JsEh::new);
        eh.init(try_pc, catch_pc, finally_pc, frame);
        self.stack.push(eh);
    }

    pub fn update_state(&mut self, event: EhEvent) -> Result<(), EngineError> {
        let eh = self.stack.last_mut().ok_or(EngineError::NoHandler)?;
        match event {
            EhEvent::Throw => eh.thrown_state = ThrownState::Raised,
            EhEvent::Catch => {
                eh.stage = EhStage::Catch;
                eh.thrown_state = ThrownState::Handled;
            }
            EhEvent::Finally => eh.stage = EhStage::Finally,
        }
        Ok(())
    }

    /// Records a throw in the current handler. The caller has already
    /// counted `value` once on behalf of the stack.
    pub fn raise(&mut self, value: JsValue) -> Result<(), EngineError> {
        let eh = self.stack.last_mut().ok_or(EngineError::NoHandler)?;
        let old = std::mem::replace(&mut eh.thrown, value);
        eh.thrown_state = ThrownState::Raised;
        self.released.push(old);
        Ok(())
    }

    /// Leaves the current try region (`endtry`/`cleanuptry`).
    pub fn free_current(&mut self) {
        if let Some(mut eh) = self.stack.pop() {
            self.released.push(std::mem::replace(&mut eh.thrown, JsValue::NONE));
            self.recycle(eh);
        }
    }

    /// Drops the regions a returning call left open.
    pub fn unwind_frame(&mut self, frame: u64) {
        while self.current().is_some_and(|eh| eh.frame == frame) {
            self.free_current();
        }
    }

    /// Records a throw that found no handler at all. The caller has already
    /// counted `value`.
    pub fn escape(&mut self, value: JsValue) {
        if let Some(old) = self.uncaught.replace(value) {
            self.released.push(old);
        }
    }

    fn recycle(&mut self, mut eh: JsEh) {
        eh.gosub.clear();
        if self.pool.len() < REUSE_POOL {
            self.pool.push(eh);
        }
    }

    /// Resolves where a raised exception goes next, as seen from `frame`.
    ///
    /// `Some(pc)` is a target inside `frame`. `None` means `frame` must
    /// return `HandleExc` to its caller; if the stack ran dry on the way,
    /// the exception is uncaught and [`EhStack::take_uncaught`] holds it.
    pub fn get_eh_pc(&mut self, frame: u64) -> Option<usize> {
        loop {
            let eh = self.stack.last()?;
            if let Some(target) = eh.local_target() {
                return (eh.frame == frame).then_some(target);
            }
            let Some(mut done) = self.stack.pop() else {
                return None;
            };
            let thrown = std::mem::replace(&mut done.thrown, JsValue::NONE);
            debug!(target: "mire::exception", "handler at {:#x} exhausted, propagating {:?}", done.try_pc, thrown);
            self.recycle(done);
            match self.stack.last_mut() {
                Some(outer) => {
                    let old = std::mem::replace(&mut outer.thrown, thrown);
                    outer.thrown_state = ThrownState::Raised;
                    self.released.push(old);
                }
                None => {
                    self.escape(thrown);
                    return None;
                }
            }
        }
    }

    /// Current handler is raised.
    pub fn is_raised(&self) -> bool {
        self.current().is_some_and(JsEh::is_raised)
    }

    /// Thrown value of the current handler.
    pub fn thrown(&self) -> Option<JsValue> {
        self.current().map(|eh| eh.thrown)
    }

    pub fn push_gosub(&mut self, ret_pc: usize) -> Result<(), EngineError> {
        let eh = self.stack.last_mut().ok_or(EngineError::NoHandler)?;
        eh.gosub.push(ret_pc);
        Ok(())
    }

    pub fn pop_gosub(&mut self) -> Result<usize, EngineError> {
        let eh = self.stack.last_mut().ok_or(EngineError::EmptyGosub)?;
        eh.gosub.pop().ok_or(EngineError::EmptyGosub)
    }

    /// Drains the values the stack no longer holds. Each was counted once.
    pub fn take_released(&mut self) -> Vec<JsValue> {
        std::mem::take(&mut self.released)
    }

    /// The exception that escaped the outermost handler, still counted.
    pub fn take_uncaught(&mut self) -> Option<JsValue> {
        self.uncaught.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_targets_catch_then_finally() {
        let mut ehs = EhStack::new();
        ehs.enter(0, Some(10), Some(20), 1);
        ehs.raise(JsValue::number(1)).unwrap();
        assert_eq!(ehs.get_eh_pc(1), Some(10));
        ehs.update_state(EhEvent::Catch).unwrap();
        assert!(!ehs.is_raised());
        ehs.raise(JsValue::number(2)).unwrap();
        assert_eq!(ehs.get_eh_pc(1), Some(20));
    }

    #[test]
    fn test_try_without_catch_goes_to_finally() {
        let mut ehs = EhStack::new();
        ehs.enter(0, None, Some(20), 1);
        ehs.raise(JsValue::number(1)).unwrap();
        assert_eq!(ehs.get_eh_pc(1), Some(20));
    }

    #[test]
    fn test_other_frame_target_is_deferred() {
        let mut ehs = EhStack::new();
        ehs.enter(0, Some(10), None, 1);
        ehs.raise(JsValue::number(1)).unwrap();
        assert_eq!(ehs.get_eh_pc(2), None);
        assert_eq!(ehs.depth(), 1);
        assert!(ehs.take_uncaught().is_none());
        assert_eq!(ehs.get_eh_pc(1), Some(10));
    }

    #[test]
    fn test_throw_in_finally_propagates_outward() {
        let mut ehs = EhStack::new();
        ehs.enter(0, Some(100), None, 1);
        ehs.enter(10, None, Some(50), 1);
        ehs.update_state(EhEvent::Finally).unwrap();
        ehs.push_gosub(60).unwrap();
        ehs.raise(JsValue::number(7)).unwrap();

        assert_eq!(ehs.get_eh_pc(1), Some(100));
        assert_eq!(ehs.depth(), 1);
        assert!(ehs.is_raised());
        assert_eq!(ehs.thrown(), Some(JsValue::number(7)));
        // the inner gosub address died with its handler
        assert!(matches!(ehs.pop_gosub(), Err(EngineError::EmptyGosub)));
    }

    #[test]
    fn test_exhausted_stack_leaves_uncaught_value() {
        let mut ehs = EhStack::new();
        ehs.enter(0, None, Some(50), 1);
        ehs.update_state(EhEvent::Finally).unwrap();
        ehs.raise(JsValue::number(3)).unwrap();
        assert_eq!(ehs.get_eh_pc(1), None);
        assert_eq!(ehs.depth(), 0);
        assert_eq!(ehs.take_uncaught(), Some(JsValue::number(3)));
    }

    #[test]
    fn test_reuse_pool_is_bounded() {
        let mut ehs = EhStack::new();
        for i in 0..4 {
            ehs.enter(i, None, None, 1);
        }
        for _ in 0..4 {
            ehs.free_current();
        }
        assert_eq!(ehs.depth(), 0);
        assert_eq!(ehs.pooled(), 2);
        ehs.enter(9, Some(1), None, 1);
        assert_eq!(ehs.pooled(), 1);
        assert_eq!(ehs.current().map(|eh| eh.stage), Some(EhStage::Try));
    }

    #[test]
    fn test_gosub_stack() {
        let mut ehs = EhStack::new();
        assert!(ehs.push_gosub(4).is_err());
        ehs.enter(0, None, Some(8), 1);
        ehs.push_gosub(4).unwrap();
        ehs.push_gosub(12).unwrap();
        assert_eq!(ehs.pop_gosub().unwrap(), 12);
        assert_eq!(ehs.pop_gosub().unwrap(), 4);
        assert!(matches!(ehs.pop_gosub(), Err(EngineError::EmptyGosub)));
    }

    #[test]
    fn test_unwind_frame_stops_at_caller_regions() {
        let mut ehs = EhStack::new();
        ehs.enter(0, Some(4), None, 1);
        ehs.enter(8, Some(12), None, 2);
        ehs.enter(16, Some(20), None, 2);
        ehs.unwind_frame(2);
        assert_eq!(ehs.depth(), 1);
        assert_eq!(ehs.current().map(|eh| eh.frame), Some(1));
    }

    #[test]
    fn test_released_values_are_reported() {
        let mut ehs = EhStack::new();
        ehs.enter(0, Some(4), None, 1);
        ehs.raise(JsValue::string(1)).unwrap();
        ehs.free_current();
        let released = ehs.take_released();
        assert!(released.contains(&JsValue::string(1)));
        assert!(ehs.take_released().is_empty());
    }
}
