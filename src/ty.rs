use serde::{Deserialize, Serialize};

/// Width of the target machine word (and of any pointer) in bytes.
pub const LONGSZ: u8 = 8;

/// Base type of an integer scalar: a width in bytes plus signedness.
///
/// `size == 0` encodes `void`.  Pointers are handled outside of this
/// struct; a pointer-typed value always has the base type [`BType::ULONG`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BType {
    pub size: u8,
    pub signed: bool,
}

impl BType {
    pub const VOID: BType = BType { size: 0, signed: false };
    pub const CHAR: BType = BType { size: 1, signed: true };
    pub const INT: BType = BType { size: 4, signed: true };
    pub const UINT: BType = BType { size: 4, signed: false };
    pub const LONG: BType = BType { size: LONGSZ, signed: true };
    pub const ULONG: BType = BType { size: LONGSZ, signed: false };

    pub fn new(size: u8, signed: bool) -> Self {
        BType { size, signed }
    }

    pub fn is_void(&self) -> bool {
        self.size == 0
    }

    /// Wrap an `i64` to this width, re-extending by signedness.
    pub fn wrap(&self, n: i64) -> i64 {
        match (self.size, self.signed) {
            (1, true) => n as i8 as i64,
            (1, false) => n as u8 as i64,
            (2, true) => n as i16 as i64,
            (2, false) => n as u16 as i64,
            (4, true) => n as i32 as i64,
            (4, false) => n as u32 as i64,
            _ => n,
        }
    }
}

/// The result type of a binary operation on `b1` and `b2`: integer
/// promotion to at least 4 bytes, signed if either side is signed.
pub fn bt_op(b1: BType, b2: BType) -> BType {
    BType {
        size: b1.size.max(b2.size).max(4),
        signed: b1.signed || b2.signed,
    }
}

/// The result type of a unary operation on `b`.
pub fn bt_uop(b: BType) -> BType {
    bt_op(b, BType::new(4, false))
}

/// Category of a type.  At most one of array/struct/function applies to
/// any C type, so the descriptor id is fused into the variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Array(usize),
    Struct(usize),
    Func(usize),
}

/// A C type: base type, pointer depth and category.
///
/// The descriptor ids in [`TypeKind`] index the arenas in
/// [`crate::sym::Syms`]; types never own their element/field/signature
/// descriptors, which allows the cyclic references that function
/// pointers inside structs require.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Type {
    pub bt: BType,
    pub ptr: u32,
    pub kind: TypeKind,
}

impl Type {
    pub fn scalar(bt: BType) -> Self {
        Type { bt, ptr: 0, kind: TypeKind::Scalar }
    }

    /// The base type as seen by the backend: any pointer is a word.
    pub fn btype(&self) -> BType {
        if self.ptr > 0 {
            BType::ULONG
        } else {
            self.bt
        }
    }

    /// Scalar width: word for pointers, declared width otherwise.
    pub fn scalar_size(&self) -> u8 {
        if self.ptr > 0 {
            LONGSZ
        } else {
            self.bt.size
        }
    }

    pub fn is_void(&self) -> bool {
        self.ptr == 0 && self.kind == TypeKind::Scalar && self.bt.is_void()
    }

    pub fn is_array(&self) -> bool {
        self.ptr == 0 && matches!(self.kind, TypeKind::Array(_))
    }

    pub fn is_struct(&self) -> bool {
        self.ptr == 0 && matches!(self.kind, TypeKind::Struct(_))
    }

    pub fn is_func(&self) -> bool {
        matches!(self.kind, TypeKind::Func(_))
    }
}

/// A named object: local, global, struct field or function parameter.
///
/// `addr` is a stack offset for locals, a data-section offset for
/// globals and a field offset for struct members.  `symname`, when
/// non-empty, overrides `name` as the emitted symbol (used for
/// function-static variables).
#[derive(Clone, Debug)]
pub struct Name {
    pub name: String,
    pub symname: String,
    pub ty: Type,
    pub addr: i64,
}

impl Name {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Name { name: name.into(), symname: String::new(), ty, addr: 0 }
    }

    /// The symbol this object is emitted under.
    pub fn sym(&self) -> &str {
        if self.symname.is_empty() {
            &self.name
        } else {
            &self.symname
        }
    }
}

/// Array descriptor: element type and length (0 = incomplete, to be
/// fixed up from the initializer).
#[derive(Clone, Debug)]
pub struct ArrayInfo {
    pub ty: Type,
    pub n: i64,
}

/// Struct or union descriptor.  Union fields all sit at offset 0 and
/// the size is the widest member.
#[derive(Clone, Debug, Default)]
pub struct StructInfo {
    pub tag: String,
    pub is_union: bool,
    pub size: i64,
    pub fields: Vec<Name>,
}

/// Function signature.  `argnames` matter only for definitions (they
/// become the parameter locals) and for K&R retro-typing.
#[derive(Clone, Debug)]
pub struct FuncInfo {
    pub ret: Type,
    pub args: Vec<Type>,
    pub argnames: Vec<String>,
    pub varg: bool,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binop_promotes_to_int() {
        let c = BType::CHAR;
        let r = bt_op(c, c);
        assert_eq!(r, BType::INT);
    }

    #[test]
    fn binop_keeps_wider_operand() {
        let r = bt_op(BType::UINT, BType::LONG);
        assert_eq!(r.size, LONGSZ);
        assert!(r.signed);
    }

    #[test]
    fn wrap_reextends_by_sign() {
        assert_eq!(BType::CHAR.wrap(0xff), -1);
        assert_eq!(BType::new(1, false).wrap(0xff), 255);
        assert_eq!(BType::INT.wrap(0x1_0000_0001), 1);
    }
}
