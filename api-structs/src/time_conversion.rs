use chrono::NaiveDateTime;

pub const NANOS_IN_1_MS: u64 = 1_000_000;
pub const NANOS_IN_1_SEC: u64 = 1_000_000_000;

// doesn't panic before the year 2262 or so
pub fn now_nanos() -> u64 {
    u64::try_from(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .expect("current time in nanos to fit i64 until 2262 or so"),
    )
    .expect("current time in nanos to be positive")
}

// doesnt panic
pub fn nanos_to_datetime(nanos: u64) -> NaiveDateTime {
    chrono::DateTime::from_timestamp(
        i64::try_from(nanos / NANOS_IN_1_SEC)
            .expect("u64 should always fit i64 after division by nanos_in_1_sec"),
        u32::try_from(nanos % NANOS_IN_1_SEC).unwrap(),
    )
    .unwrap()
    .naive_utc()
}

pub fn millis_to_nanos(millis: u64) -> u64 {
    millis * NANOS_IN_1_MS
}

pub fn secs_to_nanos(secs: u64) -> u64 {
    secs * NANOS_IN_1_SEC
}

#[test]
fn nanos_to_datetime_doesnt_panic() {
    println!("{}", nanos_to_datetime(u64::MAX));
    println!("{}", nanos_to_datetime(0));
}
