//! Reference-counted heap of the dynamic mode.
//!
//! Strings, objects, `arguments` objects and error objects live here and are
//! addressed by 32-bit handles stored in the payload of `String`/`Object`
//! cells. Counts follow the slot discipline: a fresh allocation starts at
//! zero and every store into a counted slot increments; the decrement that
//! brings a count back to zero frees the cell and releases its children.

use crate::error::EngineError;

use super::nanbox::{JsTag, JsValue};

/// Fixed accounting cost of one cell, on top of its contents.
const CELL_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    String(String),
    Object(Vec<(String, JsValue)>),
    /// The `arguments` object of one call.
    Arguments {
        values: Vec<JsValue>,
        deleted: u32,
    },
    Error {
        name: String,
        message: String,
    },
}

impl HeapObject {
    fn footprint(&self) -> usize {
        CELL_OVERHEAD
            + match self {
                HeapObject::String(s) => s.len(),
                HeapObject::Object(props) => props.iter().map(|(k, _)| k.len() + 8).sum(),
                HeapObject::Arguments { values, .. } => values.len() * 8,
                HeapObject::Error { name, message } => name.len() + message.len(),
            }
    }

    /// Cells owned by this object.
    fn children(&self) -> Vec<JsValue> {
        match self {
            HeapObject::Object(props) => props.iter().map(|(_, v)| *v).collect(),
            HeapObject::Arguments { values, .. } => values.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Cell {
    rc: u32,
    obj: HeapObject,
}

#[derive(Debug)]
pub struct JsHeap {
    cells: Vec<Option<Cell>>,
    free: Vec<u32>,
    used: usize,
    limit: usize,
}

impl JsHeap {
    pub fn new(limit: usize) -> Self {
        JsHeap {
            cells: Vec::new(),
            free: Vec::new(),
            used: 0,
            limit,
        }
    }

    /// Bytes currently accounted to live cells.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of live cells.
    pub fn live(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    fn alloc(&mut self, obj: HeapObject) -> Result<u32, EngineError> {
        let size = obj.footprint();
        if self.used + size > self.limit {
            return Err(EngineError::OutOfMemory(self.used));
        }
        self.used += size;
        let cell = Some(Cell { rc: 0, obj });
        // handles start at 1 so that a zero payload is never a live cell
        let handle = match self.free.pop() {
            Some(h) => {
                self.cells[(h - 1) as usize] = cell;
                h
            }
            None => {
                self.cells.push(cell);
                self.cells.len() as u32
            }
        };
        Ok(handle)
    }

    pub fn alloc_string(&mut self, s: impl Into<String>) -> Result<JsValue, EngineError> {
        Ok(JsValue::string(self.alloc(HeapObject::String(s.into()))?))
    }

    pub fn new_object(&mut self) -> Result<JsValue, EngineError> {
        Ok(JsValue::object(self.alloc(HeapObject::Object(Vec::new()))?))
    }

    pub fn new_error(&mut self, name: &str, message: &str) -> Result<JsValue, EngineError> {
        Ok(JsValue::object(self.alloc(HeapObject::Error {
            name: name.to_string(),
            message: message.to_string(),
        })?))
    }

    /// Creates an `arguments` object holding `values`; each one is counted.
    pub fn new_arguments(&mut self, values: &[JsValue]) -> Result<JsValue, EngineError> {
        let handle = self.alloc(HeapObject::Arguments {
            values: values.to_vec(),
            deleted: 0,
        })?;
        for &v in values {
            self.inc(v);
        }
        Ok(JsValue::object(handle))
    }

    fn cell(&self, v: JsValue) -> Option<&Cell> {
        if !v.needs_rc() {
            return None;
        }
        let h = v.handle() as usize;
        self.cells.get(h.checked_sub(1)?)?.as_ref()
    }

    fn cell_mut(&mut self, v: JsValue) -> Option<&mut Cell> {
        if !v.needs_rc() {
            return None;
        }
        let h = v.handle() as usize;
        self.cells.get_mut(h.checked_sub(1)?)?.as_mut()
    }

    pub fn get(&self, v: JsValue) -> Option<&HeapObject> {
        self.cell(v).map(|c| &c.obj)
    }

    pub fn rc(&self, v: JsValue) -> Option<u32> {
        self.cell(v).map(|c| c.rc)
    }

    pub fn as_str(&self, v: JsValue) -> Option<&str> {
        match self.get(v) {
            Some(HeapObject::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Increments the count of a counted cell; other values are ignored.
    pub fn inc(&mut self, v: JsValue) {
        if let Some(cell) = self.cell_mut(v) {
            cell.rc += 1;
        }
    }

    /// Decrements the count of a counted cell, freeing it at zero.
    pub fn dec(&mut self, v: JsValue) {
        let Some(cell) = self.cell_mut(v) else {
            return;
        };
        debug_assert!(cell.rc > 0, "reference count underflow on {:?}", v);
        cell.rc = cell.rc.saturating_sub(1);
        if cell.rc == 0 {
            self.release(v);
        }
    }

    /// Frees a cell whose count is zero (floating temporaries included).
    pub fn release_if_floating(&mut self, v: JsValue) {
        if self.rc(v) == Some(0) {
            self.release(v);
        }
    }

    fn release(&mut self, v: JsValue) {
        let h = v.handle();
        let Some(cell) = self.cells.get_mut((h - 1) as usize).and_then(Option::take) else {
            return;
        };
        self.used -= cell.obj.footprint();
        self.free.push(h);
        for child in cell.obj.children() {
            self.dec(child);
        }
    }

    // ========================================
    // Properties
    // ========================================

    pub fn get_prop(&self, obj: JsValue, key: &str) -> Option<JsValue> {
        match self.get(obj)? {
            HeapObject::Object(props) => props.iter().find(|(k, _)| k == key).map(|(_, v)| *v),
            // name and message are materialised by the property intrinsic
            HeapObject::Error { .. } => None,
            HeapObject::Arguments { values, deleted } => {
                if key == "length" {
                    return Some(JsValue::number(values.len() as i32));
                }
                let idx: usize = key.parse().ok()?;
                if idx < 32 && deleted & (1 << idx) != 0 {
                    return None;
                }
                values.get(idx).copied()
            }
            HeapObject::String(s) => (key == "length").then(|| JsValue::number(s.chars().count() as i32)),
        }
    }

    /// Stores `value` under `key`, counting the new value and releasing the
    /// old one. Returns false when `obj` cannot hold properties.
    pub fn set_prop(&mut self, obj: JsValue, key: &str, value: JsValue) -> bool {
        let old = match self.cell_mut(obj).map(|c| &mut c.obj) {
            Some(HeapObject::Object(props)) => match props.iter_mut().find(|(k, _)| k == key) {
                Some((_, slot)) => Some(std::mem::replace(slot, value)),
                None => {
                    props.push((key.to_string(), value));
                    None
                }
            },
            _ => return false,
        };
        self.used += key.len() + 8;
        self.inc(value);
        if let Some(old) = old {
            self.used -= key.len() + 8;
            self.dec(old);
        }
        true
    }

    /// Mirrors a formal write into the `arguments` object.
    pub fn set_argument(&mut self, args: JsValue, index: usize, value: JsValue) {
        let old = match self.cell_mut(args).map(|c| &mut c.obj) {
            Some(HeapObject::Arguments { values, deleted }) => {
                if index >= values.len() || (index < 32 && *deleted & (1 << index) != 0) {
                    return;
                }
                std::mem::replace(&mut values[index], value)
            }
            _ => return,
        };
        self.inc(value);
        self.dec(old);
    }

    /// Marks `index` of an `arguments` object deleted.
    pub fn delete_argument(&mut self, args: JsValue, index: usize) -> bool {
        match self.cell_mut(args).map(|c| &mut c.obj) {
            Some(HeapObject::Arguments { deleted, .. }) if index < 32 => {
                *deleted |= 1 << index;
                true
            }
            _ => false,
        }
    }

    pub fn argument_deleted(&self, args: JsValue, index: usize) -> bool {
        match self.get(args) {
            Some(HeapObject::Arguments { deleted, .. }) => index < 32 && deleted & (1 << index) != 0,
            _ => false,
        }
    }

    // ========================================
    // String forms
    // ========================================

    /// `ToString` of any cell.
    pub fn to_display(&self, v: JsValue) -> String {
        match v.tag() {
            JsTag::Undefined => "undefined".into(),
            JsTag::Null => "null".into(),
            JsTag::None => "undefined".into(),
            JsTag::Boolean => if v.as_i32() != 0 { "true" } else { "false" }.into(),
            JsTag::Number => v.as_i32().to_string(),
            JsTag::Double | JsTag::Nan | JsTag::Infinity => format_number(v.to_f64().unwrap_or(f64::NAN)),
            JsTag::Function => "function".into(),
            JsTag::String | JsTag::Object | JsTag::Env => match self.get(v) {
                Some(HeapObject::String(s)) => s.clone(),
                Some(HeapObject::Error { name, message }) if message.is_empty() => name.clone(),
                Some(HeapObject::Error { name, message }) => format!("{}: {}", name, message),
                Some(HeapObject::Arguments { .. }) => "[object Arguments]".into(),
                Some(HeapObject::Object(_)) => "[object Object]".into(),
                None => format!("<dangling {:#x}>", v.payload()),
            },
            JsTag::SpBase | JsTag::FpBase | JsTag::GpBase | JsTag::Unknown => format!("{:?}", v),
        }
    }
}

/// JavaScript-style number formatting.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.into()
    } else if n == 0.0 {
        "0".into()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{}", n)
    }
}
