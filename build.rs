fn main() {
    println!("cargo:rerun-if-env-changed=TARGET");

    // NVS storage and EspLogger need the ESP-IDF environment; host builds
    // and the simulated stack do not.
    let esp32 = std::env::var_os("CARGO_FEATURE_ESP32").is_some();
    let xtensa = std::env::var("TARGET").is_ok_and(|t| t.contains("xtensa"));
    if esp32 && xtensa {
        embuild::espidf::sysenv::output();
    }
}
