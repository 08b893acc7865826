use std::cell::RefCell;
use std::time::{Duration, SystemTime};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        dst.extend_from_slice(cache.borrow_mut().buffer());
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cache = CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            next_update: SystemTime::UNIX_EPOCH,
        };
        cache.update(SystemTime::now());
        cache
    }

    fn buffer(&mut self) -> &[u8] {
        let now = SystemTime::now();
        if now > self.next_update {
            self.update(now);
        }
        &self.bytes[..]
    }

    fn update(&mut self, now: SystemTime) {
        let s = httpdate::fmt_http_date(now);
        debug_assert!(s.len() == DATE_VALUE_LENGTH);
        self.bytes.copy_from_slice(s.as_bytes());
        self.next_update = now + Duration::from_secs(1);
    }
}
