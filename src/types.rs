use crate::trap::{Result, Trap};

/// Primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValType {
    I32 = 0x7F,
    I64 = 0x7E,
    F32 = 0x7D,
    F64 = 0x7C,
}

impl ValType {
    /// Single-character signature code, wasm3 convention.
    pub fn code(self) -> char {
        match self {
            ValType::I32 => 'i',
            ValType::I64 => 'I',
            ValType::F32 => 'f',
            ValType::F64 => 'F',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'i' => Some(ValType::I32),
            'I' => Some(ValType::I64),
            'f' => Some(ValType::F32),
            'F' => Some(ValType::F64),
            _ => None,
        }
    }
}

/// Function signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncType {
    pub params: Vec<ValType>,
    /// At most 1 result.
    pub results: Vec<ValType>,
}

impl FuncType {
    /// Parse a signature string such as `"i(iI)"` or `"v()"`.
    ///
    /// Codes: `v` void, `i` i32, `I` i64, `f` f32, `F` f64. The return
    /// code precedes the parenthesized parameter list.
    pub fn parse_signature(sig: &str) -> Result<FuncType> {
        let bad = || Trap::InvalidSignature(sig.to_string());

        let open = sig.find('(').ok_or_else(bad)?;
        if !sig.ends_with(')') {
            return Err(bad());
        }
        let ret = &sig[..open];
        let params_str = &sig[open + 1..sig.len() - 1];

        let results = match ret {
            "v" | "" => Vec::new(),
            _ => {
                let mut chars = ret.chars();
                let c = chars.next().ok_or_else(bad)?;
                if chars.next().is_some() {
                    return Err(bad());
                }
                vec![ValType::from_code(c).ok_or_else(bad)?]
            }
        };

        let mut params = Vec::with_capacity(params_str.len());
        for c in params_str.chars() {
            params.push(ValType::from_code(c).ok_or_else(bad)?);
        }

        Ok(FuncType { params, results })
    }

    /// Canonical signature string for this type.
    pub fn signature(&self) -> String {
        let mut s = String::with_capacity(self.params.len() + 3);
        match self.results.first() {
            Some(t) => s.push(t.code()),
            None => s.push('v'),
        }
        s.push('(');
        for p in &self.params {
            s.push(p.code());
        }
        s.push(')');
        s
    }
}

/// A runtime value crossing the host boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    /// Raw slot encoding: i32/f32 occupy the low 32 bits, zero-extended.
    pub fn to_bits(self) -> u64 {
        match self {
            Val::I32(v) => v as u32 as u64,
            Val::I64(v) => v as u64,
            Val::F32(v) => v.to_bits() as u64,
            Val::F64(v) => v.to_bits(),
        }
    }

    pub fn from_bits(ty: ValType, bits: u64) -> Val {
        match ty {
            ValType::I32 => Val::I32(bits as u32 as i32),
            ValType::I64 => Val::I64(bits as i64),
            ValType::F32 => Val::F32(f32::from_bits(bits as u32)),
            ValType::F64 => Val::F64(f64::from_bits(bits)),
        }
    }

    pub fn as_i32(self) -> Option<i32> {
        if let Val::I32(v) = self { Some(v) } else { None }
    }
    pub fn as_i64(self) -> Option<i64> {
        if let Val::I64(v) = self { Some(v) } else { None }
    }
    pub fn as_f32(self) -> Option<f32> {
        if let Val::F32(v) = self { Some(v) } else { None }
    }
    pub fn as_f64(self) -> Option<f64> {
        if let Val::F64(v) = self { Some(v) } else { None }
    }

    pub fn default_for(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0.0),
            ValType::F64 => Val::F64(0.0),
        }
    }
}
