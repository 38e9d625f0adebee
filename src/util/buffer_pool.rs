use std::cell::RefCell;

const INITIAL_KEY_CAPACITY: usize = 256;

thread_local! {
    static KEY_BUFFERS: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` with a reusable thread-local byte buffer.
///
/// The buffer is cleared on checkout and returned to the pool afterwards, so
/// its capacity grows monotonically across uses. Intended for index-entry
/// assembly (ident prefix + encoded key + record id), where a fresh allocation
/// per entry would dominate multi-index insert paths. Calls may nest; each
/// nesting level gets its own buffer.
pub fn with_key_buffer<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    let mut buf = KEY_BUFFERS
        .with(|pool| pool.borrow_mut().pop())
        .unwrap_or_else(|| Vec::with_capacity(INITIAL_KEY_CAPACITY));
    buf.clear();
    let out = f(&mut buf);
    KEY_BUFFERS.with(|pool| pool.borrow_mut().push(buf));
    out
}

/// Prime the calling thread's pooled buffer for at least `capacity` bytes.
///
/// Useful once per document when the caller knows the prefixed-key size it is
/// about to build repeatedly.
pub fn reserve_key_capacity(capacity: usize) {
    with_key_buffer(|buf| {
        if buf.capacity() < capacity {
            buf.reserve(capacity - buf.len());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_cleared_on_checkout() {
        with_key_buffer(|buf| buf.extend_from_slice(b"leftover"));
        with_key_buffer(|buf| assert!(buf.is_empty()));
    }

    #[test]
    fn capacity_grows_monotonically() {
        with_key_buffer(|buf| buf.extend_from_slice(&[0u8; 1024]));
        with_key_buffer(|buf| assert!(buf.capacity() >= 1024));
    }

    #[test]
    fn nested_checkouts_get_distinct_buffers() {
        with_key_buffer(|outer| {
            outer.push(1);
            with_key_buffer(|inner| {
                assert!(inner.is_empty());
                inner.push(2);
            });
            assert_eq!(outer.as_slice(), &[1]);
        });
    }

    #[test]
    fn reserve_primes_the_pool() {
        reserve_key_capacity(4096);
        with_key_buffer(|buf| assert!(buf.capacity() >= 4096));
    }
}
