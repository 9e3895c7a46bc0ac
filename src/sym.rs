use anyhow::{bail, Result};

use crate::ty::{ArrayInfo, FuncInfo, Name, StructInfo, Type, TypeKind, LONGSZ};

// Growable tables, but each keeps a hard cap so a runaway input still
// dies with a distinct message instead of exhausting memory.
const NLOCALS: usize = 1 << 14;
const NGLOBALS: usize = 1 << 16;
const NENUMS: usize = 1 << 16;
const NTYPEDEFS: usize = 1 << 14;
const NSTRUCTS: usize = 1 << 12;
const NFUNCS: usize = 1 << 13;
const NARRAYS: usize = 1 << 14;

#[derive(Clone, Debug)]
pub struct EnumVal {
    pub name: String,
    pub n: i64,
}

/// Snapshot of all table lengths at compound-statement entry; exit
/// truncates back to it, which is all of C's lexical scoping here.
#[derive(Clone, Copy, Debug)]
pub struct ScopeMark {
    nlocals: usize,
    nglobals: usize,
    nenums: usize,
    ntypedefs: usize,
    nstructs: usize,
    nfuncs: usize,
    narrays: usize,
}

/// Every name and descriptor table of the translation unit.
///
/// Name tables are searched newest-first, so an inner declaration
/// shadows an outer one until its scope is truncated away.
#[derive(Default)]
pub struct Syms {
    pub locals: Vec<Name>,
    pub globals: Vec<Name>,
    pub enums: Vec<EnumVal>,
    pub typedefs: Vec<(String, Type)>,
    pub structs: Vec<StructInfo>,
    pub funcs: Vec<FuncInfo>,
    pub arrays: Vec<ArrayInfo>,
}

impl Syms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_add(&mut self, name: Name) -> Result<()> {
        if self.locals.len() >= NLOCALS {
            bail!("nomem: NLOCALS reached!");
        }
        self.locals.push(name);
        Ok(())
    }

    pub fn local_find(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|l| l.name == name)
    }

    pub fn global_add(&mut self, name: Name) -> Result<()> {
        if self.globals.len() >= NGLOBALS {
            bail!("nomem: NGLOBALS reached!");
        }
        self.globals.push(name);
        Ok(())
    }

    pub fn global_find(&self, name: &str) -> Option<usize> {
        self.globals.iter().rposition(|g| g.name == name)
    }

    pub fn enum_add(&mut self, name: &str, n: i64) -> Result<()> {
        if self.enums.len() >= NENUMS {
            bail!("nomem: NENUMS reached!");
        }
        self.enums.push(EnumVal { name: name.to_string(), n });
        Ok(())
    }

    pub fn enum_find(&self, name: &str) -> Option<i64> {
        self.enums.iter().rev().find(|e| e.name == name).map(|e| e.n)
    }

    pub fn typedef_add(&mut self, name: &str, ty: Type) -> Result<()> {
        if self.typedefs.len() >= NTYPEDEFS {
            bail!("nomem: NTYPEDEFS reached!");
        }
        self.typedefs.push((name.to_string(), ty));
        Ok(())
    }

    pub fn typedef_find(&self, name: &str) -> Option<Type> {
        self.typedefs.iter().rev().find(|(n, _)| n == name).map(|(_, t)| *t)
    }

    /// Find a struct/union by tag, creating an empty descriptor when the
    /// tag is unknown (forward references and anonymous tags).
    pub fn struct_find(&mut self, tag: &str, is_union: bool) -> Result<usize> {
        if !tag.is_empty() {
            if let Some(i) = self
                .structs
                .iter()
                .rposition(|s| s.tag == tag && s.is_union == is_union)
            {
                return Ok(i);
            }
        }
        if self.structs.len() >= NSTRUCTS {
            bail!("nomem: NSTRUCTS reached!");
        }
        self.structs.push(StructInfo {
            tag: tag.to_string(),
            is_union,
            ..Default::default()
        });
        Ok(self.structs.len() - 1)
    }

    pub fn struct_field(&self, id: usize, name: &str) -> Option<Name> {
        self.structs[id].fields.iter().find(|f| f.name == name).cloned()
    }

    pub fn func_create(&mut self, fi: FuncInfo) -> Result<usize> {
        if self.funcs.len() >= NFUNCS {
            bail!("nomem: NFUNCS reached!");
        }
        self.funcs.push(fi);
        Ok(self.funcs.len() - 1)
    }

    pub fn array_add(&mut self, ty: Type, n: i64) -> Result<usize> {
        if self.arrays.len() >= NARRAYS {
            bail!("nomem: NARRAYS reached!");
        }
        self.arrays.push(ArrayInfo { ty, n });
        Ok(self.arrays.len() - 1)
    }

    /// Array-to-pointer decay: a non-pointer array becomes a pointer to
    /// its element type.
    pub fn array2ptr(&self, t: &mut Type) {
        if let TypeKind::Array(id) = t.kind {
            if t.ptr == 0 {
                *t = self.arrays[id].ty;
                t.ptr += 1;
            }
        }
    }

    /// Total size of a type in bytes.
    pub fn totsz(&self, t: &Type) -> i64 {
        if t.ptr > 0 {
            return LONGSZ as i64;
        }
        match t.kind {
            TypeKind::Array(id) => {
                let a = &self.arrays[id];
                a.n * self.totsz(&a.ty)
            }
            TypeKind::Struct(id) => self.structs[id].size,
            _ => t.bt.size as i64,
        }
    }

    /// Size of `*t`, the pointer-arithmetic scale factor.
    pub fn szde(&self, t: &Type) -> i64 {
        let mut de = *t;
        self.array2ptr(&mut de);
        debug_assert!(de.ptr > 0);
        de.ptr = de.ptr.saturating_sub(1);
        self.totsz(&de)
    }

    /// Field-packing alignment: scalar/pointer align to their own size
    /// capped at the word; aggregates follow their leading element.
    pub fn alignment(&self, t: &Type) -> i64 {
        if t.is_array() {
            if let TypeKind::Array(id) = t.kind {
                return self.alignment(&self.arrays[id].ty);
            }
        }
        if t.is_struct() {
            if let TypeKind::Struct(id) = t.kind {
                if let Some(first) = self.structs[id].fields.first() {
                    return self.alignment(&first.ty);
                }
                return 1;
            }
        }
        (LONGSZ as i64).min(self.totsz(t))
    }

    /// Innermost element type of a (possibly nested) array.
    pub fn innertype(&self, t: &Type) -> Type {
        if let TypeKind::Array(id) = t.kind {
            if t.ptr == 0 {
                return self.innertype(&self.arrays[id].ty);
            }
        }
        *t
    }

    pub fn mark(&self) -> ScopeMark {
        ScopeMark {
            nlocals: self.locals.len(),
            nglobals: self.globals.len(),
            nenums: self.enums.len(),
            ntypedefs: self.typedefs.len(),
            nstructs: self.structs.len(),
            nfuncs: self.funcs.len(),
            narrays: self.arrays.len(),
        }
    }

    /// Restore the tables to a scope mark, dropping everything the
    /// closed scope declared.
    pub fn truncate(&mut self, m: ScopeMark) {
        self.locals.truncate(m.nlocals);
        self.globals.truncate(m.nglobals);
        self.enums.truncate(m.nenums);
        self.typedefs.truncate(m.ntypedefs);
        self.structs.truncate(m.nstructs);
        self.funcs.truncate(m.nfuncs);
        self.arrays.truncate(m.narrays);
    }

    /// Drop all per-function state (called after a function body).
    pub fn clear_locals(&mut self) {
        self.locals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::BType;

    #[test]
    fn newest_first_shadowing() {
        let mut s = Syms::new();
        let int = Type::scalar(BType::INT);
        let ch = Type::scalar(BType::CHAR);
        s.local_add(Name::new("x", int)).unwrap();
        s.local_add(Name::new("x", ch)).unwrap();
        let i = s.local_find("x").unwrap();
        assert_eq!(s.locals[i].ty.bt, BType::CHAR);
    }

    #[test]
    fn struct_tag_find_or_create() {
        let mut s = Syms::new();
        let a = s.struct_find("point", false).unwrap();
        let b = s.struct_find("point", false).unwrap();
        assert_eq!(a, b);
        // same tag as a union is a different descriptor
        let c = s.struct_find("point", true).unwrap();
        assert_ne!(a, c);
        // anonymous tags never unify
        let d = s.struct_find("", false).unwrap();
        let e = s.struct_find("", false).unwrap();
        assert_ne!(d, e);
    }

    #[test]
    fn array_sizes_multiply() {
        let mut s = Syms::new();
        let int = Type::scalar(BType::INT);
        let inner = s.array_add(int, 4).unwrap();
        let inner_t = Type { bt: BType::ULONG, ptr: 0, kind: TypeKind::Array(inner) };
        let outer = s.array_add(inner_t, 3).unwrap();
        let outer_t = Type { bt: BType::ULONG, ptr: 0, kind: TypeKind::Array(outer) };
        assert_eq!(s.totsz(&outer_t), 48);
        assert_eq!(s.szde(&outer_t), 16);
        assert_eq!(s.alignment(&outer_t), 4);
    }

    #[test]
    fn decay_increments_ptr() {
        let mut s = Syms::new();
        let int = Type::scalar(BType::INT);
        let id = s.array_add(int, 10).unwrap();
        let mut t = Type { bt: BType::ULONG, ptr: 0, kind: TypeKind::Array(id) };
        s.array2ptr(&mut t);
        assert_eq!(t.ptr, 1);
        assert_eq!(t.kind, TypeKind::Scalar);
        assert_eq!(t.bt, BType::INT);
    }

    #[test]
    fn scope_truncation_restores_all_tables() {
        let mut s = Syms::new();
        let int = Type::scalar(BType::INT);
        s.local_add(Name::new("a", int)).unwrap();
        let m = s.mark();
        s.local_add(Name::new("b", int)).unwrap();
        s.typedef_add("t", int).unwrap();
        s.struct_find("inner", false).unwrap();
        s.array_add(int, 2).unwrap();
        s.truncate(m);
        assert_eq!(s.locals.len(), 1);
        assert!(s.typedef_find("t").is_none());
        assert!(s.structs.is_empty());
        assert!(s.arrays.is_empty());
    }
}
