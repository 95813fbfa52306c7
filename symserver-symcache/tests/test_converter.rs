use similar_asserts::assert_eq;
use symserver_common::DebugId;
use symserver_symcache::{SymCache, SymCacheConverter};
use symserver_symfile::SymFile;

type Error = Box<dyn std::error::Error>;

fn debug_id(s: &str) -> DebugId {
    s.parse().unwrap()
}

fn build(sym_text: &str) -> Result<Vec<u8>, Error> {
    let sym = SymFile::parse(&debug_id("DEADBEEF"), sym_text.as_bytes())?;
    let mut converter = SymCacheConverter::new();
    converter.process_symfile(&sym);
    let mut buffer = Vec::new();
    converter.serialize(&mut buffer)?;
    Ok(buffer)
}

/// Renders the frames at an address as `name@file:line`, innermost first.
fn resolve(cache: &SymCache, addr: u64) -> Vec<String> {
    cache
        .lookup(addr)
        .map(|location| {
            format!(
                "{}@{}:{}",
                location.function_name().unwrap_or("?"),
                location.file().unwrap_or("-"),
                location.line().unwrap_or(0),
            )
        })
        .collect()
}

#[test]
fn lookup_function_with_line_records() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FILE 7 src/foo.cpp
FUNC 1200 100 0 foo
1200 34 41 7
1234 8 42 7
123c c4 43 7
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    assert_eq!(resolve(&cache, 0x1234), vec!["foo@src/foo.cpp:42"]);
    assert_eq!(resolve(&cache, 0x123b), vec!["foo@src/foo.cpp:42"]);
    assert_eq!(resolve(&cache, 0x1200), vec!["foo@src/foo.cpp:41"]);
    assert_eq!(resolve(&cache, 0x12ff), vec!["foo@src/foo.cpp:43"]);

    // before and after the function
    assert!(resolve(&cache, 0x11ff).is_empty());
    assert!(resolve(&cache, 0x1300).is_empty());
    Ok(())
}

#[test]
fn lookup_function_without_lines_keeps_name_only() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FUNC 1000 40 0 bare
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    assert_eq!(resolve(&cache, 0x1020), vec!["bare@-:0"]);
    Ok(())
}

#[test]
fn lookup_inline_chain_innermost_first() -> Result<(), Error> {
    // outer() calls mid() which calls leaf(); both calls are inlined. The
    // line records describe leaf()'s body in the covered range.
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FILE 1 outer.cpp
FILE 2 mid.cpp
FILE 3 leaf.cpp
INLINE_ORIGIN 10 mid()
INLINE_ORIGIN 11 leaf()
FUNC 1000 100 0 outer()
INLINE 0 100 1 10 1020 40
INLINE 1 200 2 11 1030 10
1000 20 7 1
1030 10 300 3
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    // Inside the innermost inline: leaf body line, then mid at its call
    // site of leaf, then outer at its call site of mid.
    assert_eq!(
        resolve(&cache, 0x1035),
        vec![
            "leaf()@leaf.cpp:300",
            "mid()@mid.cpp:200",
            "outer()@outer.cpp:100",
        ]
    );

    // Inside mid() but not leaf(): two frames.
    assert_eq!(
        resolve(&cache, 0x1025),
        vec!["mid()@-:0", "outer()@outer.cpp:100"]
    );

    // Plain outer code.
    assert_eq!(resolve(&cache, 0x1005), vec!["outer()@outer.cpp:7"]);
    Ok(())
}

#[test]
fn lookup_inline_chain_snapshot() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FILE 1 outer.cpp
FILE 2 mid.cpp
FILE 3 leaf.cpp
INLINE_ORIGIN 10 mid()
INLINE_ORIGIN 11 leaf()
FUNC 1000 100 0 outer()
INLINE 0 100 1 10 1020 40
INLINE 1 200 2 11 1030 10
1000 20 7 1
1030 10 300 3
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    insta::assert_debug_snapshot!(resolve(&cache, 0x1035), @r###"
    [
        "leaf()@leaf.cpp:300",
        "mid()@mid.cpp:200",
        "outer()@outer.cpp:100",
    ]
    "###);
    Ok(())
}

#[test]
fn lookup_overlapping_inline_ranges_last_wins() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FILE 1 a.cpp
INLINE_ORIGIN 1 first()
INLINE_ORIGIN 2 second()
FUNC 1000 100 0 outer()
INLINE 0 10 1 1 1010 20
INLINE 0 20 1 2 1010 20
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    let frames = resolve(&cache, 0x1018);
    assert_eq!(frames[0], "second()@-:0");
    Ok(())
}

#[test]
fn lookup_public_fallback() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE windows x86_64 DEADBEEF xul.pdb
FUNC 1000 100 0 real_function
PUBLIC 2000 0 public_one
PUBLIC 3000 0 public_two
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    // The gap between the function end and the first public is unmapped.
    assert!(resolve(&cache, 0x1500).is_empty());

    assert_eq!(resolve(&cache, 0x2000), vec!["public_one@-:0"]);
    assert_eq!(resolve(&cache, 0x2fff), vec!["public_one@-:0"]);
    // The last public extends to infinity.
    assert_eq!(resolve(&cache, 0x123456), vec!["public_two@-:0"]);
    Ok(())
}

#[test]
fn lookup_public_shadowed_by_function() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE windows x86_64 DEADBEEF xul.pdb
FUNC 1000 100 0 real_function
PUBLIC 1010 0 shadowed
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    assert_eq!(resolve(&cache, 0x1010), vec!["real_function@-:0"]);
    Ok(())
}

#[test]
fn overlapping_functions_last_wins() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FUNC 1000 100 0 first
FUNC 1000 100 0 second
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    assert_eq!(resolve(&cache, 0x1050), vec!["second@-:0"]);
    Ok(())
}

#[test]
fn mangled_names_are_demangled() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FUNC 1000 10 0 _ZN5boost6system14system_categoryEv
PUBLIC 2000 0 _ZN3std2io4Read11read_to_end17hb85a0f6802e14499E
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    assert_eq!(
        resolve(&cache, 0x1000)[0],
        "boost::system::system_category()@-:0"
    );
    assert_eq!(
        resolve(&cache, 0x2000)[0],
        "std::io::Read::read_to_end@-:0"
    );
    Ok(())
}

#[test]
fn function_entry_is_exposed() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FUNC 1200 100 0 foo
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    let location = cache.lookup(0x1234).next().unwrap();
    assert_eq!(location.function_entry(), Some(0x1200));
    Ok(())
}

#[test]
fn zero_sized_functions_are_skipped() -> Result<(), Error> {
    let buffer = build(
        "\
MODULE Linux x86_64 DEADBEEF crash
FUNC 1000 0 0 empty
",
    )?;
    let cache = SymCache::parse(&buffer)?;

    assert!(resolve(&cache, 0x1000).is_empty());
    assert_eq!(cache.num_ranges(), 0);
    Ok(())
}
