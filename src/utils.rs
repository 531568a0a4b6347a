//! Random crate utilities
use std::{
    collections::HashSet,
    ffi::{CStr, CString, c_char},
    sync::{Mutex, PoisonError},
};

/// Strings referenced by records, kept alive for the rest of the process.
#[derive(Default)]
struct Interned {
    by_value: HashSet<&'static CStr>,
    /// Addresses of the strings in `by_value`.
    addresses: HashSet<usize>,
}

static INTERNED: Mutex<Option<Interned>> = Mutex::new(None);

/// Return a pointer to a process-lifetime, NUL-terminated copy of `value`.
///
/// Records store names as C string pointers, so the pointee must outlive every buffer that
/// can contain the record. Each distinct string is leaked once. Interior NUL bytes truncate
/// the string.
pub(crate) fn intern(value: &str) -> *const c_char {
    let value = value.split('\0').next().unwrap_or_default();
    let mut interned = INTERNED.lock().unwrap_or_else(PoisonError::into_inner);
    let interned = interned.get_or_insert_with(Interned::default);
    let key = CString::new(value).unwrap_or_default();
    if let Some(existing) = interned.by_value.get(key.as_c_str()) {
        return existing.as_ptr();
    }
    let leaked: &'static CStr = Box::leak(key.into_boxed_c_str());
    interned.by_value.insert(leaked);
    interned.addresses.insert(leaked.as_ptr() as usize);
    leaked.as_ptr()
}

/// Like [intern], but maps `None` to a nullptr.
pub(crate) fn intern_opt(value: Option<&str>) -> *const c_char {
    value.map_or(std::ptr::null(), intern)
}

/// Look up a string previously returned by [intern].
///
/// Records are plain bytes that anyone can fill in, so a pointer read from a record is only
/// followed if it is the start of an interned string. Anything else yields `None`.
pub(crate) fn interned_cstr(c_str: *const c_char) -> Option<&'static CStr> {
    if c_str.is_null() {
        return None;
    }
    let interned = INTERNED.lock().unwrap_or_else(PoisonError::into_inner);
    interned
        .as_ref()?
        .addresses
        .contains(&(c_str as usize))
        // Safety: interned strings are leaked, NUL-terminated and never freed.
        .then(|| unsafe { CStr::from_ptr(c_str) })
}

/// Return an interned string if it is valid UTF-8.
pub(crate) fn interned_str(c_str: *const c_char) -> Option<&'static str> {
    interned_cstr(c_str).and_then(|c_str| c_str.to_str().ok())
}

/// Return a demangled interned symbol name. Names that are not mangled are returned as-is.
pub(crate) fn interned_demangled(c_str: *const c_char) -> Option<String> {
    interned_str(c_str).map(|utf8_str| {
        cpp_demangle::Symbol::new(utf8_str)
            .map(|symbol| symbol.to_string())
            .unwrap_or_else(|_| utf8_str.to_owned())
    })
}
