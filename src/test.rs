use rstest::rstest;

use std::fs::File;

use crate::obj::{Object, SymKind};
use crate::vm::Vm;
use crate::Options;

fn compile(src: &str) -> Object {
    crate::compile_str("test.c", src, &Options::default()).expect("compile error")
}

/// Compile, push the object through its on-disk encoding, and run
/// `main` in the interpreter.
fn run_main(src: &str) -> i64 {
    let obj = compile(src);
    let mut buf = Vec::new();
    obj.write(&mut buf).unwrap();
    let obj = Object::read(&mut buf.as_slice()).unwrap();
    Vm::new(obj).unwrap().run("main", &[]).unwrap()
}

fn compile_err(src: &str) -> String {
    crate::compile_str("test.c", src, &Options::default())
        .err()
        .expect("expected a compile error")
        .to_string()
}

#[rstest]
#[case::constant_fold("int main(){ return 2+3*4; }", 14)]
#[case::recursion("int f(int n){ return n<=1?1:n*f(n-1);} int main(){return f(5);}", 120)]
#[case::global_array("int a[3]={10,20,30}; int main(){ int *p=a; return p[2]-p[0]; }", 20)]
#[case::struct_fields(
    "struct P{int x,y;}; int main(){struct P p={3,4}; return p.x*p.x+p.y*p.y;}",
    25
)]
#[case::for_loop("int main(){int i,s=0;for(i=0;i<10;i++)s+=i;return s;}", 45)]
#[case::switch_fallthrough(
    "int main(){int x=0;switch(2){case 1:x=1;break;case 2:x=2;case 3:x+=10;break;default:x=99;}return x;}",
    12
)]
#[case::string_global("char*s=\"hi\"; int main(){return s[0]+s[1];}", 209)]
fn whole_programs(#[case] src: &str, #[case] expect: i64) {
    assert_eq!(run_main(src), expect);
}

#[rstest]
#[case::while_break_continue(
    "int main(){int i=0,s=0;while(1){i++;if(i>10)break;if(i%2)continue;s+=i;}return s;}",
    30
)]
#[case::do_while("int main(){int i=0;do i++; while(i<5); return i;}", 5)]
#[case::goto_backward("int main(){int i=0;again: i++; if(i<3)goto again; return i;}", 3)]
#[case::goto_forward("int main(){goto out; return 1; out: return 2;}", 2)]
#[case::ternary_const_true("int main(){ return 1 ? 42 : 13; }", 42)]
#[case::ternary_const_false("int main(){ return 0 ? 13 : 42; }", 42)]
#[case::ternary_runtime("int f(int c){return c?10:20;} int main(){return f(1)+f(0);}", 30)]
#[case::logic_values("int main(){ return (5 && 3) + (0 || 7); }", 2)]
#[case::comma("int main(){int x;x=(1,2,3);return x;}", 3)]
#[case::pre_post_inc("int main(){int i=5;int a=i++;int b=++i;return a*100+b*10+i;}", 577)]
#[case::cast_narrowing("int main(){ return (char)300; }", 44)]
#[case::arith_shift("int main(){int x;x = -8;return x >> 1;}", -4)]
#[case::fold_ops("int main(){ return 7 % 4 + (1 << 3); }", 11)]
#[case::negative_div("int main(){int a;a = -7;return a / 2;}", -3)]
#[case::nested_calls(
    "int add(int a,int b){return a+b;} int main(){return add(add(1,2),add(3,4));}",
    10
)]
#[case::void_fn("int g; void set(int v){g=v;return;} int main(){set(8);return g;}", 8)]
#[case::global_bss("int g; int main(){ g = 7; return g; }", 7)]
#[case::global_postinc("int g; int inc(){g++;return g;} int main(){inc();inc();return g;}", 2)]
#[case::empty_body_for("int main(){int i;for(i=0;i<3;i++);return i;}", 3)]
fn language_features(#[case] src: &str, #[case] expect: i64) {
    assert_eq!(run_main(src), expect);
}

#[rstest]
#[case::ptr_scaling(
    "int main(){int a[4];long d;int *p=a;int *q=p+3;d=(long)q-(long)p;return d*10+(q-p);}",
    123
)]
#[case::ptr_postinc("int main(){int a[2];int *p=a;a[0]=7;a[1]=9;int x=*p++;return x*10+*p;}", 79)]
#[case::ptr_compound("int main(){int a[3];int *p=a;a[2]=5;p+=2;return *p;}", 5)]
#[case::deref_star("int main(){int x;int *p=&x;*p=9;return x;}", 9)]
#[case::array_star("int main(){int a[2];a[0]=6;return *a;}", 6)]
#[case::matrix("int m[2][3]; int main(){m[1][2]=7;return m[1][2]+sizeof(m);}", 31)]
#[case::char_array_local(
    "int main(){char s[] = \"ab\"; return sizeof(s)*100 + s[0] + s[2];}",
    397
)]
#[case::incomplete_array("int a[]={1,2,3,4,5}; int main(){return sizeof(a)/sizeof(a[0]);}", 5)]
#[case::unsigned_char_zero_extends("int main(){unsigned char c;c = 200;return c > 100;}", 1)]
#[case::signed_char_sign_extends("int main(){char c;c = 200;return c < 0;}", 1)]
fn pointers_and_arrays(#[case] src: &str, #[case] expect: i64) {
    assert_eq!(run_main(src), expect);
}

#[rstest]
#[case::padding("struct S{char c;int i;}; int main(){return sizeof(struct S);}", 8)]
#[case::field_offset("struct S{char c;int i;}; int main(){struct S s;return (long)&s.i-(long)&s;}", 4)]
#[case::union_size("union U{char c;int i;long l;}; int main(){return sizeof(union U);}", 8)]
#[case::union_overlay("union U{int i;char c;}; int main(){union U u;u.i=0x41424344;return u.c;}", 0x44)]
#[case::nested(
    "struct P{int x;int y;}; struct Q{struct P p[2];int n;}; int main(){struct Q q;q.p[1].y=7;q.n=2;return q.p[1].y*q.n;}",
    14
)]
#[case::arrow("struct P{int x,y;}; int main(){struct P p;struct P *q=&p;q->y=9;return q->y;}", 9)]
#[case::struct_assign(
    "struct P{int x,y;}; int main(){struct P a,b;a.x=3;a.y=4;b=a;return b.x+b.y;}",
    7
)]
#[case::designated_array("int a[6]={[4]=9}; int main(){return a[4]*10+a[0];}", 90)]
#[case::designated_struct(
    "struct P{int x,y;}; struct P p={.y=4}; int main(){return p.x*10+p.y;}",
    4
)]
fn structs_and_unions(#[case] src: &str, #[case] expect: i64) {
    assert_eq!(run_main(src), expect);
}

#[rstest]
#[case::enums("enum { A, B = 5, C }; int main(){ return A + B + C; }", 11)]
#[case::typedefs("typedef int myint; typedef myint *pint; int main(){myint x=3;pint p=&x;*p=9;return x;}", 9)]
#[case::knr("int add(a, b) int a; int b; { return a + b; } int main(){ return add(40, 2); }", 42)]
#[case::static_local(
    "int cnt() { static int n = 0; n += 1; return n; } int main(){ cnt(); cnt(); return cnt(); }",
    3
)]
#[case::shadowing("int main(){int x=1;{int x=2;x=x+1;}return x;}", 1)]
#[case::block_struct_shadow(
    "int main(){struct S{int a;};{struct S{int b;} s;s.b=1;}struct S t;t.a=2;return t.a;}",
    2
)]
#[case::fn_pointer(
    "int add(int a,int b){return a+b;} int main(){int (*fp)(int,int);fp=add;return fp(2,3);}",
    5
)]
#[case::const_erased("const int x = 5; int main(){return x;}", 5)]
#[case::attribute_erased("int __attribute__((unused)) g = 3; int main(){return g;}", 3)]
fn declarations(#[case] src: &str, #[case] expect: i64) {
    assert_eq!(run_main(src), expect);
}

#[rstest]
#[case::object_macro("#define N 10\nint main(){return N+N;}", 20)]
#[case::function_macro("#define SQ(x) ((x)*(x))\nint main(){return SQ(3+1);}", 16)]
#[case::stdc_predefined("int main(){\n#ifdef __STDC__\nreturn 1;\n#else\nreturn 0;\n#endif\n}", 1)]
#[case::if_chain("#define V 2\n#if V == 1\nint main(){return 1;}\n#elif V == 2\nint main(){return 2;}\n#else\nint main(){return 3;}\n#endif", 2)]
#[case::strings_concat("char *s = \"a\" \"bc\"; int main(){return s[2];}", 'c' as i64)]
fn preprocessing(#[case] src: &str, #[case] expect: i64) {
    assert_eq!(run_main(src), expect);
}

#[test]
fn short_circuit_skips_side_effects() {
    let src = "int g; int side(){g+=1;return 1;}
               int main(){g=0; 0 && side(); 1 || side(); return g;}";
    assert_eq!(run_main(src), 0);
    let src = "int g; int side(){g+=1;return 0;}
               int main(){g=0; 1 && side(); 0 || side(); return g;}";
    assert_eq!(run_main(src), 2);
}

#[test]
fn sizeof_emits_no_code() {
    let a = compile("int f(){int x;x=0;return sizeof(x++);}");
    let b = compile("int f(){int x;x=0;return 4;}");
    assert_eq!(a.funcs[0].ops, b.funcs[0].ops);
    assert_eq!(a.funcs[0].frame_size, b.funcs[0].frame_size);
}

#[test]
fn sizeof_of_dead_increment_leaves_value() {
    assert_eq!(
        run_main("int main(){int x;int sz;x=0;sz=sizeof(x++);return x*100+sz;}"),
        4
    );
}

#[test]
fn dead_ternary_arm_emits_nothing() {
    // the dead arm calls a function; no call op may survive
    let obj = compile("int f(){return 1;} int main(){return 1 ? 7 : f();}");
    let main = &obj.funcs[1];
    assert!(
        !main
            .ops
            .iter()
            .any(|op| matches!(op, crate::obj::Op::Call { .. })),
        "dead arm was emitted: {:?}",
        main.ops
    );
    assert_eq!(run_main("int f(){return 1;} int main(){return 1 ? 7 : f();}"), 7);
}

#[test]
fn implicit_extern_function_declaration() {
    let obj = compile("int f(){ return g(); } int main(){ return 0; }");
    let (_, sym) = obj.sym_by_name("g").expect("g recorded");
    assert_eq!(sym.kind, SymKind::Und);
    assert_eq!(
        Vm::new(obj).unwrap().run("main", &[]).unwrap(),
        0,
        "undefined extern only faults when actually called"
    );
}

#[test]
fn string_literals_become_data_symbols() {
    let obj = compile("char *s = \"hi\"; int main(){return 0;}");
    let (_, sym) = obj.sym_by_name("__rcc.s0").expect("string symbol");
    assert_eq!(sym.kind, SymKind::Data);
    assert_eq!(sym.size, 3);
    assert_eq!(obj.relocs.len(), 1, "the global holds the string's address");
}

#[test]
fn statics_are_not_global_symbols() {
    let obj = compile("static int hidden = 1; int shown = 2; int main(){return hidden+shown;}");
    assert!(!obj.sym_by_name("hidden").unwrap().1.global);
    assert!(obj.sym_by_name("shown").unwrap().1.global);
}

#[test]
fn run_arbitrary_function_with_arguments() {
    let obj = compile("int mul(int a, int b){ return a * b; }");
    assert_eq!(Vm::new(obj).unwrap().run("mul", &[6, 7]).unwrap(), 42);
}

#[rstest]
#[case::unknown_symbol("int main(){return nope;}", "unknown symbol")]
#[case::deref_non_pointer("int main(){int x;x=0;return *x;}", "dereferencing non-pointer")]
#[case::addr_of_rvalue("int main(){return &5;}", "cannot use the address")]
#[case::no_field("struct P{int x;}; int main(){struct P p;return p.z;}", "field not found")]
#[case::nonconst_array("int x; int a[x]; int main(){return 0;}", "const expr expected")]
#[case::nonconst_enum("int x; enum { A = x }; int main(){return 0;}", "const expr expected")]
#[case::stray_token("int main(){return 0;} }", "syntax error")]
fn rejected_programs(#[case] src: &str, #[case] needle: &str) {
    let msg = compile_err(src);
    assert!(msg.contains(needle), "error <{msg}> misses <{needle}>");
    assert!(msg.starts_with("test.c:"), "error <{msg}> lacks a location");
}

#[test]
fn includes_and_defines_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let inc = dir.path().join("inc");
    std::fs::create_dir(&inc).unwrap();
    std::fs::write(inc.join("answer.h"), "#define ANSWER 42\n").unwrap();
    std::fs::write(
        dir.path().join("local.h"),
        "#include <answer.h>\n#define LOCAL 1\n",
    )
    .unwrap();
    let src = dir.path().join("t.c");
    std::fs::write(
        &src,
        "#include \"local.h\"\n#if FEATURE && LOCAL\nint main(){return ANSWER;}\n#else\nint main(){return 0;}\n#endif\n",
    )
    .unwrap();
    let opts = Options {
        include_paths: vec![inc],
        defines: vec!["FEATURE=1".into()],
    };
    let obj = crate::compile_file(&src, &opts).unwrap();
    let out = dir.path().join("t.o");
    obj.write(&mut File::create(&out).unwrap()).unwrap();
    let back = Object::read(&mut File::open(&out).unwrap()).unwrap();
    assert_eq!(Vm::new(back).unwrap().run("main", &[]).unwrap(), 42);
}

#[test]
fn error_location_tracks_include_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.h"), "int broken(){return nope;}\n").unwrap();
    let src = dir.path().join("t.c");
    std::fs::write(&src, "#include \"bad.h\"\nint main(){return 0;}\n").unwrap();
    let err = crate::compile_file(&src, &Options::default())
        .err()
        .expect("compile error")
        .to_string();
    assert!(err.contains("bad.h:1"), "got <{err}>");
}

#[test]
fn stack_depths_match_across_control_flow() {
    // a torture loop mixing leftovers, breaks and nested calls; any
    // push/pop imbalance across a join faults in the interpreter
    let src = "int f(int n){ return n + 1; }
               int main(){
                   int i, s;
                   s = 0;
                   for (i = 0; i < 5; i++) {
                       i + 1;
                       s += f(i) ? f(s) - s : 0;
                       if (i == 3) continue;
                       switch (i) { case 0: s++; case 1: s += 2; break; default: s--; }
                   }
                   return s;
               }";
    let obj = compile(src);
    Vm::new(obj).unwrap().run("main", &[]).unwrap();
}

#[test]
fn deep_recursion_is_reported_not_fatal() {
    let err = {
        let obj = compile("int f(int n){ return f(n + 1); } int main(){ return f(0); }");
        Vm::new(obj).unwrap().run("main", &[]).unwrap_err()
    };
    assert!(err.to_string().contains("call depth"));
}
