fn main() {
    // Build scripts run on the host; only ESP-IDF targets need the IDF environment
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.ends_with("-espidf") {
        embuild::espidf::sysenv::output();
    }
}
