#[cfg(test)]
#[ctor::ctor]
fn init_tests() {
    // logger for tests only, tracing events reach it through the `log` feature
    let _ = env_logger::builder().is_test(true).try_init();
}
