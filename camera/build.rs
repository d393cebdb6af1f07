use embuild::{build::CfgArgs, espidf};

fn main() {
    if std::env::var_os("CARGO_FEATURE_ESP32").is_none() {
        return;
    }

    if let Err(err) = CfgArgs::output_propagated("ESP_IDF") {
        println!("cargo:warning=esp-idf cfg args unavailable: {err}");
    }
    espidf::sysenv::output();

    println!("cargo:rerun-if-changed=bindings.h");
}
