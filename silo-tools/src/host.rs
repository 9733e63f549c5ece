use once_cell::sync::Lazy;

static NODENAME: Lazy<String> = Lazy::new(|| {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "localhost".to_string()
});

/// The local host name, as recorded in lock records.
pub fn nodename() -> &'static str {
    &NODENAME
}
