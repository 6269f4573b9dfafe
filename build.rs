fn main() {
    if !(cfg!(target_os = "linux")
        && (cfg!(target_arch = "x86_64") || cfg!(target_arch = "x86"))
        && cfg!(target_env = "gnu"))
    {
        panic!(
            "{} only works with linux using glibc on x86 or x86-64",
            env!("CARGO_PKG_NAME")
        );
    }
}
