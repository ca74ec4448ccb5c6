//! Host functions exposed to conversion scripts.
//!
//! Scripts get `sha256`/`sha512` (input lowercased before hashing),
//! `generateUUIDv4`, and a `time` module with `parse`/`format` using
//! chrono `%`-style format strings.

use chrono::NaiveDateTime;
use rhai::{Engine, EvalAltResult, Module};
use sha2::{Digest, Sha256, Sha512};
use uuid::Uuid;

/// Opaque timestamp passed between `time::parse` and `time::format`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptTime(pub NaiveDateTime);

/// Register the host toolkit on an engine.
pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptTime>("Time");
    engine.register_fn("sha256", sha256);
    engine.register_fn("sha512", sha512);
    engine.register_fn("generateUUIDv4", generate_uuid_v4);

    let mut time = Module::new();
    time.set_native_fn("parse", time_parse);
    time.set_native_fn("format", time_format);
    engine.register_static_module("time", time.into());
}

fn sha256(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.to_lowercase()))
}

fn sha512(value: &str) -> String {
    format!("{:x}", Sha512::digest(value.to_lowercase()))
}

fn generate_uuid_v4() -> String {
    Uuid::new_v4().to_string()
}

fn time_parse(value: &str, format: &str) -> Result<ScriptTime, Box<EvalAltResult>> {
    NaiveDateTime::parse_from_str(value, format)
        .map(ScriptTime)
        .map_err(|err| format!("time parse failed: {err}").into())
}

fn time_format(time: ScriptTime, format: &str) -> Result<String, Box<EvalAltResult>> {
    let mut rendered = String::new();
    use std::fmt::Write;
    write!(rendered, "{}", time.0.format(format))
        .map_err(|_| Box::<EvalAltResult>::from("time format failed: invalid format string"))?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_lowercases_input() {
        assert_eq!(
            sha256("ABC"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256("abc"), sha256("ABC"));
    }

    #[test]
    fn test_sha512_lowercases_input() {
        assert_eq!(
            sha512("Abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_uuid_is_valid_v4() {
        let id = generate_uuid_v4();
        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_time_round_trip() {
        let time = time_parse("2024-03-01 10:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(time_format(time, "%d.%m.%Y").unwrap(), "01.03.2024");
    }

    #[test]
    fn test_time_parse_rejects_garbage() {
        assert!(time_parse("not a date", "%Y-%m-%d").is_err());
    }
}
