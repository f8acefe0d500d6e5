//! Intrinsic ids and the native intrinsic table.
//!
//! An `intrinsiccall` names its operation by a one-byte id. Static-mode
//! ids either resolve to a native function registered in
//! [`IntrinsicTable`] (called through FFI) or to one of the hand-written
//! blocks in the static interpreter. Ids from `0x80` up belong to the
//! dynamic runtime.

use super::native::NativeTable;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrinsicId {
    // static, hand-written
    MplClinitCheck = 0x01,
    MplCleanupLocalRefVars = 0x02,
    MplCleanupLocalRefVarsSkip = 0x03,
    MccCallSlowNative = 0x04,

    // static, registered natives
    MccNewObjFixedClass = 0x10,
    MccNewObjFlexibleCname = 0x11,
    CSqrt = 0x12,
    CMemset = 0x13,
    CMemcpy = 0x14,
    CStrlen = 0x15,

    // dynamic runtime
    JsPrint = 0x80,
    JsopConcat = 0x81,
    JsNewObject0 = 0x82,
    JsopGetpropByName = 0x83,
    JsopSetpropByName = 0x84,
    JsNumber = 0x85,
    JsBoolean = 0x86,
    JsString = 0x87,
    JsopStrictEq = 0x88,
    JsopStrictNe = 0x89,
    JsopTypeof = 0x8a,
    JsError = 0x8b,
    JsopDeleteArgument = 0x8c,
    JsGetArgumentObject = 0x8d,
    JsopLength = 0x8e,
    JsIsNan = 0x8f,
    JsopAdd = 0x90,
}

impl IntrinsicId {
    pub fn from_u8(byte: u8) -> Option<IntrinsicId> {
        use IntrinsicId::*;
        Some(match byte {
            0x01 => MplClinitCheck,
            0x02 => MplCleanupLocalRefVars,
            0x03 => MplCleanupLocalRefVarsSkip,
            0x04 => MccCallSlowNative,
            0x10 => MccNewObjFixedClass,
            0x11 => MccNewObjFlexibleCname,
            0x12 => CSqrt,
            0x13 => CMemset,
            0x14 => CMemcpy,
            0x15 => CStrlen,
            0x80 => JsPrint,
            0x81 => JsopConcat,
            0x82 => JsNewObject0,
            0x83 => JsopGetpropByName,
            0x84 => JsopSetpropByName,
            0x85 => JsNumber,
            0x86 => JsBoolean,
            0x87 => JsString,
            0x88 => JsopStrictEq,
            0x89 => JsopStrictNe,
            0x8a => JsopTypeof,
            0x8b => JsError,
            0x8c => JsopDeleteArgument,
            0x8d => JsGetArgumentObject,
            0x8e => JsopLength,
            0x8f => JsIsNan,
            0x90 => JsopAdd,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use IntrinsicId::*;
        match self {
            MplClinitCheck => "MPL_CLINIT_CHECK",
            MplCleanupLocalRefVars => "MPL_CLEANUP_LOCALREFVARS",
            MplCleanupLocalRefVarsSkip => "MPL_CLEANUP_LOCALREFVARS_SKIP",
            MccCallSlowNative => "MCC_CALL_SLOW_NATIVE",
            MccNewObjFixedClass => "MCC_NEW_OBJ_FIXED_CLASS",
            MccNewObjFlexibleCname => "MCC_NEW_OBJ_FLEXIBLE_CNAME",
            CSqrt => "C_sqrt",
            CMemset => "C_memset",
            CMemcpy => "C_memcpy",
            CStrlen => "C_strlen",
            JsPrint => "JS_PRINT",
            JsopConcat => "JSOP_CONCAT",
            JsNewObject0 => "JS_NEW_OBJECT_0",
            JsopGetpropByName => "JSOP_GETPROP_BY_NAME",
            JsopSetpropByName => "JSOP_SETPROP_BY_NAME",
            JsNumber => "JS_NUMBER",
            JsBoolean => "JS_BOOLEAN",
            JsString => "JS_STRING",
            JsopStrictEq => "JSOP_STRICTEQ",
            JsopStrictNe => "JSOP_STRICTNE",
            JsopTypeof => "JSOP_TYPEOF",
            JsError => "JS_ERROR",
            JsopDeleteArgument => "JSOP_DELETE_ARGUMENT",
            JsGetArgumentObject => "JS_GET_ARGUMENTOBJECT",
            JsopLength => "JSOP_LENGTH",
            JsIsNan => "JS_ISNAN",
            JsopAdd => "JSOP_ADD",
        }
    }

    /// Allocation intrinsics whose result is announced to the runtime.
    pub fn is_allocation(self) -> bool {
        matches!(self, IntrinsicId::MccNewObjFixedClass | IntrinsicId::MccNewObjFlexibleCname)
    }

    pub fn is_dynamic(self) -> bool {
        self as u8 >= 0x80
    }
}

/// Intrinsic id to native function pointer.
#[derive(Debug, Clone)]
pub struct IntrinsicTable {
    entries: Vec<u64>,
}

impl Default for IntrinsicTable {
    fn default() -> Self {
        let mut table = IntrinsicTable::empty();
        let libc_natives = NativeTable::default();
        if let Some(sqrt) = libc_natives.lookup("sqrt") {
            table.register(IntrinsicId::CSqrt, sqrt);
        }
        if let Some(strlen) = libc_natives.lookup("strlen") {
            table.register(IntrinsicId::CStrlen, strlen);
        }
        table.register(IntrinsicId::CMemset, libc::memset as *const () as u64);
        table.register(IntrinsicId::CMemcpy, libc::memcpy as *const () as u64);
        table
    }
}

impl IntrinsicTable {
    pub fn empty() -> Self {
        IntrinsicTable { entries: vec![0; 256] }
    }

    pub fn register(&mut self, id: IntrinsicId, addr: u64) {
        self.entries[id as usize] = addr;
    }

    /// Registered native for `id`, if any.
    pub fn native(&self, id: u8) -> Option<u64> {
        match self.entries[id as usize] {
            0 => None,
            addr => Some(addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(id) = IntrinsicId::from_u8(byte) {
                assert_eq!(id as u8, byte);
                assert_eq!(id.is_dynamic(), byte >= 0x80);
            }
        }
    }

    #[test]
    fn test_default_table() {
        let table = IntrinsicTable::default();
        assert!(table.native(IntrinsicId::CSqrt as u8).is_some());
        assert!(table.native(IntrinsicId::MplClinitCheck as u8).is_none());
        assert!(table.native(IntrinsicId::MccNewObjFixedClass as u8).is_none());
    }
}
