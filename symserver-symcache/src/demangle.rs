//! Demangling of mangled symbol names.
//!
//! Breakpad symbol dumpers usually emit demangled names already, so this is
//! only applied to names that still carry a recognizable mangling prefix.
//! Demangling failures keep the mangled name intact.

use std::borrow::Cow;

fn is_maybe_cpp(ident: &str) -> bool {
    ident.starts_with("_Z")
        || ident.starts_with("__Z")
        || ident.starts_with("___Z")
        || ident.starts_with("____Z")
}

fn is_maybe_msvc(ident: &str) -> bool {
    ident.starts_with('?') || ident.starts_with("@?")
}

fn is_maybe_rust(ident: &str) -> bool {
    ident.starts_with("_R") || ident.starts_with("__R")
}

fn try_demangle_msvc(ident: &str) -> Option<String> {
    use msvc_demangler::DemangleFlags as MsvcFlags;

    let flags = MsvcFlags::COMPLETE
        | MsvcFlags::SPACE_AFTER_COMMA
        | MsvcFlags::HUG_TYPE
        | MsvcFlags::NO_MS_KEYWORDS
        | MsvcFlags::NO_CLASS_TYPE;

    msvc_demangler::demangle(ident, flags).ok()
}

fn try_demangle_cpp(ident: &str) -> Option<String> {
    let symbol = cpp_demangle::Symbol::new(ident).ok()?;
    symbol
        .demangle(&cpp_demangle::DemangleOptions::default())
        .ok()
}

fn try_demangle_rust(ident: &str) -> Option<String> {
    // Strips the trailing hash of legacy mangled names.
    rustc_demangle::try_demangle(ident)
        .map(|demangled| format!("{demangled:#}"))
        .ok()
}

/// Demangles a symbol name if it carries a known mangling prefix.
///
/// Itanium-style names are first offered to the Rust demangler, which only
/// accepts genuine Rust hashes, before falling back to the C++ demangler.
/// Names without a recognized prefix, and names that fail to demangle, are
/// returned unchanged.
pub fn demangle(name: &str) -> Cow<'_, str> {
    let demangled = if is_maybe_msvc(name) {
        try_demangle_msvc(name)
    } else if is_maybe_rust(name) {
        try_demangle_rust(name)
    } else if is_maybe_cpp(name) {
        try_demangle_rust(name).or_else(|| try_demangle_cpp(name))
    } else {
        None
    };

    match demangled {
        Some(demangled) => Cow::Owned(demangled),
        None => Cow::Borrowed(name),
    }
}
