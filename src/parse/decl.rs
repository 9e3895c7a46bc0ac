use anyhow::{bail, Result};

use super::{DefCtx, Parser};
use crate::tok::Kind;
use crate::ty::{BType, FuncInfo, Name, Type, TypeKind, LONGSZ};

const NFIELDS: usize = 1 << 10;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct StorageFlags {
    pub is_static: bool,
    pub is_extern: bool,
}

/// Where a sub-declarator's final type gets written: one of the three
/// scratch slots, or the element type of an array descriptor (needed
/// for declarators like `int (*f[10])(int)`).
#[derive(Clone, Copy, Debug)]
enum TPlace {
    Pool(usize),
    Arr(usize),
}

impl Parser {
    fn place_get(&self, pool: &[Type; 3], p: TPlace) -> Type {
        match p {
            TPlace::Pool(i) => pool[i],
            TPlace::Arr(id) => self.syms.arrays[id].ty,
        }
    }

    fn place_mut<'a>(&'a mut self, pool: &'a mut [Type; 3], p: TPlace) -> &'a mut Type {
        match p {
            TPlace::Pool(i) => &mut pool[i],
            TPlace::Arr(id) => &mut self.syms.arrays[id].ty,
        }
    }

    /// Parse storage-class and type-specifier keywords into a base
    /// type.  Returns `None` (consuming nothing) when the next tokens
    /// do not start a declaration.
    pub(crate) fn base_type(&mut self) -> Result<Option<(Type, StorageFlags)>> {
        let mut flags = StorageFlags::default();
        let mut sign = true;
        let mut size: u8 = 4;
        let mut done = false;
        let mut i = 0;
        loop {
            match self.toks.see() {
                Kind::Static => flags.is_static = true,
                Kind::Extern => flags.is_extern = true,
                Kind::Void => {
                    sign = false;
                    size = 0;
                    done = true;
                }
                Kind::Int => done = true,
                Kind::Char => {
                    size = 1;
                    done = true;
                }
                Kind::Short => size = 2,
                // `long long` collapses to `long`
                Kind::Long => size = LONGSZ,
                Kind::Signed => (),
                Kind::Unsigned => sign = false,
                Kind::Struct | Kind::Union => {
                    let is_union = self.toks.get().kind == Kind::Union;
                    let mut tag = String::new();
                    if self.toks.see() == Kind::Name {
                        tag = self.toks.get().text.clone();
                    }
                    let id = if self.toks.see() == Kind::LBrace {
                        self.struct_create(&tag, is_union)?
                    } else {
                        self.syms.struct_find(&tag, is_union)?
                    };
                    let t = Type { bt: BType::ULONG, ptr: 0, kind: TypeKind::Struct(id) };
                    return Ok(Some((t, flags)));
                }
                Kind::Enum => {
                    self.toks.get();
                    if self.toks.see() == Kind::Name {
                        self.toks.get();
                    }
                    if self.toks.see() == Kind::LBrace {
                        self.enum_create()?;
                    }
                    return Ok(Some((Type::scalar(BType::INT), flags)));
                }
                Kind::Name => {
                    let text = self.toks.peek().text.clone();
                    if let Some(t) = self.syms.typedef_find(&text) {
                        self.toks.get();
                        return Ok(Some((t, flags)));
                    }
                    if i == 0 {
                        return Ok(None);
                    }
                    break;
                }
                _ => {
                    if i == 0 {
                        return Ok(None);
                    }
                    break;
                }
            }
            i += 1;
            self.toks.get();
            if done {
                break;
            }
        }
        Ok(Some((Type::scalar(BType::new(size, sign)), flags)))
    }

    fn struct_create(&mut self, tag: &str, is_union: bool) -> Result<usize> {
        let id = self.syms.struct_find(tag, is_union)?;
        self.toks.expect(Kind::LBrace)?;
        while !self.toks.jmp(Kind::RBrace) {
            if self.toks.see() == Kind::Eof {
                return Err(self.err("syntax error"));
            }
            self.read_defs(DefCtx::Field(id))?;
            self.toks.expect(Kind::Semi)?;
        }
        Ok(id)
    }

    fn enum_create(&mut self) -> Result<()> {
        let mut n: i64 = 0;
        self.toks.expect(Kind::LBrace)?;
        while !self.toks.jmp(Kind::RBrace) {
            let name = self.toks.expect(Kind::Name)?.text.clone();
            if self.toks.jmp(Kind::Assign) {
                self.expr()?;
                self.ts_pop_de();
                n = self
                    .g_popnum()
                    .ok_or_else(|| self.err("const expr expected!"))?;
            }
            self.syms.enum_add(&name, n)?;
            n += 1;
            self.toks.jmp(Kind::Comma);
        }
        Ok(())
    }

    fn read_ptrs(&mut self, t: &mut Type) {
        while self.toks.jmp(Kind::Star) {
            t.ptr += 1;
            // `void *` dereferences byte-wise
            if t.bt.is_void() && t.kind == TypeKind::Scalar {
                t.bt = BType::new(1, false);
            }
        }
    }

    /// Parse `[n]...` postfix dimensions, wrapping `*t` innermost-first.
    /// Returns the array descriptor whose element is the innermost type
    /// so a parenthesized sub-declarator can be patched in later.
    fn read_arrays(&mut self, t: &mut Type) -> Result<Option<usize>> {
        let mut dims = Vec::new();
        while self.toks.jmp(Kind::LBrk) {
            let mut n: i64 = 0;
            if !self.toks.jmp(Kind::RBrk) {
                self.expr()?;
                self.ts_pop_de();
                n = self
                    .g_popnum()
                    .ok_or_else(|| self.err("const expr expected"))?;
                self.toks.expect(Kind::RBrk)?;
            }
            dims.push(n);
        }
        let mut inner = None;
        for &n in dims.iter().rev() {
            let id = self.syms.array_add(*t, n)?;
            if inner.is_none() {
                inner = Some(id);
            }
            *t = Type { bt: BType::ULONG, ptr: 0, kind: TypeKind::Array(id) };
        }
        Ok(inner)
    }

    /// Parse comma-separated function parameters.  Parameter arrays
    /// decay to pointers; a lone `void` means no parameters.
    fn read_args(&mut self) -> Result<(Vec<Type>, Vec<String>, bool)> {
        let mut args: Vec<Type> = Vec::new();
        let mut names = Vec::new();
        let mut varg = false;
        self.toks.expect(Kind::LPar)?;
        while self.toks.see() != Kind::RPar {
            if self.toks.jmp(Kind::Ellipsis) {
                varg = true;
                break;
            }
            match self.declarator(None)? {
                Some((mut t, name)) => {
                    // parameter arrays are pointers
                    self.syms.array2ptr(&mut t);
                    args.push(t);
                    names.push(name);
                }
                None => {
                    // no type: a K&R parameter name, typed later
                    let name = self.toks.expect(Kind::Name)?.text.clone();
                    args.push(Type::scalar(BType::INT));
                    names.push(name);
                }
            }
            if !self.toks.jmp(Kind::Comma) {
                break;
            }
        }
        self.toks.expect(Kind::RPar)?;
        if args.len() == 1 && args[0].btype().is_void() {
            args.clear();
            names.clear();
        }
        Ok((args, names, varg))
    }

    /// The classic C declarator: pointers, a possibly parenthesized
    /// sub-declarator, arrays, then a parameter list.  `base` carries
    /// the base type shared by a comma-separated definition statement;
    /// without it the base type is read here (and `None` is returned
    /// when there is none).
    pub(crate) fn declarator(&mut self, base: Option<Type>) -> Result<Option<(Type, String)>> {
        let mut pool = [Type::scalar(BType::VOID); 3];
        let mut npool = 0;
        let mut ty = TPlace::Pool(npool);
        npool += 1;
        let mut ptype: Option<TPlace> = None;
        let mut btype: Option<TPlace> = None;
        let mut name = String::new();
        match base {
            Some(b) => pool[0] = b,
            None => match self.base_type()? {
                Some((b, _)) => pool[0] = b,
                None => return Ok(None),
            },
        }
        {
            let mut tmp = self.place_get(&pool, ty);
            self.read_ptrs(&mut tmp);
            *self.place_mut(&mut pool, ty) = tmp;
        }
        if self.toks.jmp(Kind::LPar) {
            btype = Some(ty);
            ty = TPlace::Pool(npool);
            npool += 1;
            let mut tmp = self.place_get(&pool, ty);
            self.read_ptrs(&mut tmp);
            *self.place_mut(&mut pool, ty) = tmp;
            ptype = Some(ty);
        }
        if self.toks.see() == Kind::Name {
            name = self.toks.get().text.clone();
        }
        {
            let mut tmp = self.place_get(&pool, ty);
            let inner = self.read_arrays(&mut tmp)?;
            *self.place_mut(&mut pool, ty) = tmp;
            if ptype.is_some() {
                if let Some(id) = inner {
                    ptype = Some(TPlace::Arr(id));
                }
            }
        }
        if ptype.is_some() {
            self.toks.expect(Kind::RPar)?;
        }
        if self.toks.see() == Kind::LPar {
            let (args, argnames, varg) = self.read_args()?;
            if ptype.is_none() {
                btype = Some(ty);
                ty = TPlace::Pool(npool);
                ptype = Some(ty);
            }
            let ret = self.place_get(&pool, btype.expect("function has a return slot"));
            let fid = self.syms.func_create(FuncInfo {
                ret,
                args,
                argnames,
                varg,
                name: name.clone(),
            })?;
            let place = ptype.expect("just set");
            let slot = self.place_mut(&mut pool, place);
            slot.kind = TypeKind::Func(fid);
            slot.bt = BType::ULONG;
            // K&R parameter declarations between `)` and `{`
            if self.toks.see() != Kind::Semi {
                while self.toks.see() != Kind::LBrace {
                    if !self.read_defs(DefCtx::Kr(fid))? {
                        break;
                    }
                    self.toks.expect(Kind::Semi)?;
                }
            }
        } else if ptype.is_some() {
            let mut tmp = self.place_get(&pool, ty);
            let outer = self.read_arrays(&mut tmp)?;
            if outer.is_some() {
                self.syms.array2ptr(&mut tmp);
            }
            *self.place_mut(&mut pool, ty) = tmp;
        }
        Ok(Some((self.place_get(&pool, ty), name)))
    }

    /// A type name with no object, as used by casts and `sizeof`.
    pub(crate) fn read_type(&mut self) -> Result<Option<Type>> {
        Ok(self.declarator(None)?.map(|(t, _)| t))
    }

    /// Parse one `base decl (, decl)*` definition statement, routing
    /// each declarator through `ctx`.  Returns false (consuming
    /// nothing) when no base type is present.
    pub(crate) fn read_defs(&mut self, ctx: DefCtx) -> Result<bool> {
        let Some((base, flags)) = self.base_type()? else {
            return Ok(false);
        };
        if self.toks.see() == Kind::Semi || self.toks.see() == Kind::LBrace {
            return Ok(true);
        }
        loop {
            let Some((ty, name)) = self.declarator(Some(base))? else {
                break;
            };
            let mut nm = Name::new(name, ty);
            self.define_name(ctx, &mut nm, flags)?;
            if !self.toks.jmp(Kind::Comma) {
                break;
            }
        }
        Ok(true)
    }

    /// Like `read_defs` but a missing base type defaults to `int`, for
    /// K&R-style top-level definitions.
    pub(crate) fn read_defs_int(&mut self, ctx: DefCtx) -> Result<bool> {
        let (base, flags) = match self.base_type()? {
            Some(b) => b,
            None => {
                if self.toks.see() != Kind::Name {
                    return Ok(false);
                }
                (Type::scalar(BType::INT), StorageFlags::default())
            }
        };
        if self.toks.see() != Kind::Semi {
            loop {
                let Some((ty, name)) = self.declarator(Some(base))? else {
                    break;
                };
                let mut nm = Name::new(name, ty);
                self.define_name(ctx, &mut nm, flags)?;
                if !self.toks.jmp(Kind::Comma) {
                    break;
                }
            }
        }
        Ok(true)
    }

    fn define_name(&mut self, ctx: DefCtx, name: &mut Name, flags: StorageFlags) -> Result<()> {
        match ctx {
            DefCtx::Typedef => self.syms.typedef_add(&name.name, name.ty),
            DefCtx::Field(id) => self.field_def(id, name),
            DefCtx::Kr(fid) => {
                let fi = &mut self.syms.funcs[fid];
                for i in 0..fi.argnames.len() {
                    if fi.argnames[i] == name.name {
                        fi.args[i] = name.ty;
                    }
                }
                Ok(())
            }
            DefCtx::Global => self.global_def(name, flags),
            DefCtx::Local => self.local_def(name, flags),
        }
    }

    /// Lay a field into a struct or union: unions overlay everything at
    /// offset 0 and grow to the widest member, structs append with
    /// per-field alignment.
    fn field_def(&mut self, id: usize, name: &mut Name) -> Result<()> {
        if self.syms.structs[id].fields.len() >= NFIELDS {
            bail!("nomem: NFIELDS reached!");
        }
        let tsz = self.syms.totsz(&name.ty);
        if self.syms.structs[id].is_union {
            name.addr = 0;
            if self.syms.structs[id].size < tsz {
                self.syms.structs[id].size = tsz;
            }
        } else {
            let t = name.ty;
            let mut alignment = self.syms.alignment(&t);
            if let TypeKind::Array(aid) = t.kind {
                if t.ptr == 0 {
                    let elem = self.syms.arrays[aid].ty;
                    alignment = (LONGSZ as i64).min(self.syms.totsz(&elem));
                }
            }
            let alignment = alignment.max(1);
            let off = (self.syms.structs[id].size + alignment - 1) & !(alignment - 1);
            name.addr = off;
            self.syms.structs[id].size = off + tsz;
        }
        self.syms.structs[id].fields.push(name.clone());
        Ok(())
    }

    fn global_def(&mut self, name: &mut Name, flags: StorageFlags) -> Result<()> {
        let t = name.ty;
        if let TypeKind::Array(id) = t.kind {
            if t.ptr == 0 && self.syms.arrays[id].n == 0 && !flags.is_extern {
                self.syms.arrays[id].n = self.init_size()?;
            }
        }
        let sz = self.syms.totsz(&name.ty);
        if !flags.is_extern && (!t.is_func() || t.ptr > 0) {
            let symname = name.sym().to_string();
            if self.toks.see() == Kind::Assign {
                name.addr = self.gen.dsnew(&symname, sz, !flags.is_static);
            } else {
                self.gen.bsnew(&symname, sz, !flags.is_static);
            }
        }
        self.syms.global_add(name.clone())?;
        if self.toks.jmp(Kind::Assign) {
            let tgt = super::init::InitTarget::Global { name: name.clone() };
            self.init_expr(t, 0, &tgt)?;
        }
        if self.toks.see() == Kind::LBrace && name.ty.is_func() {
            self.func_def(name, flags.is_static)?;
        }
        Ok(())
    }

    fn local_def(&mut self, name: &mut Name, flags: StorageFlags) -> Result<()> {
        let t = name.ty;
        // non-defining declarations fall through to the global table
        if flags.is_extern || (t.is_func() && t.ptr == 0) {
            self.syms.global_add(name.clone())?;
            return Ok(());
        }
        if flags.is_static {
            name.symname = format!("__rcc.{}.{}", self.func_name, name.name);
            return self.global_def(name, flags);
        }
        if let TypeKind::Array(id) = t.kind {
            if t.ptr == 0 && self.syms.arrays[id].n == 0 {
                self.syms.arrays[id].n = self.init_size()?;
            }
        }
        let sz = self.syms.totsz(&name.ty);
        name.addr = self.gen.mklocal(sz);
        let addr = name.addr;
        self.syms.local_add(name.clone())?;
        if self.toks.jmp(Kind::Assign) {
            if (t.is_array() || t.is_struct()) && t.ptr == 0 {
                self.g_local(addr);
                self.g_num(0);
                self.g_num(sz);
                self.g_memset();
                self.g_drop(1);
            }
            let tgt = super::init::InitTarget::Local { addr };
            self.init_expr(t, 0, &tgt)?;
        }
        Ok(())
    }
}
