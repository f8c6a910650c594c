//! Content fingerprints for launch specifications.
//!
//! The fingerprint is the warm-pool cache key: a warm VM is only useful to a
//! job whose spec hashes to the same value. Canonicalization sorts all map
//! keys at every level, so two structurally equivalent specs fingerprint
//! identically regardless of key order in the input. The hash is xxh3-64;
//! it is not a security boundary.

use xxhash_rust::xxh3::xxh3_64;

use crate::spec::VmSpec;

/// Fingerprint of a spec: 16 uppercase hex chars.
pub fn fingerprint(spec: &VmSpec) -> String {
    // serde_json::Value maps are BTreeMap-backed, so converting the spec to
    // a Value and serializing it yields sorted keys at every level.
    let canonical =
        serde_json::to_value(spec).expect("VmSpec is plain data and always serializes");
    let bytes =
        serde_json::to_vec(&canonical).expect("canonical JSON value always serializes");
    format!("{:016X}", xxh3_64(&bytes))
}

/// Fingerprint a spec arriving as raw JSON, preserving unknown keys.
pub fn fingerprint_json(spec_json: &serde_json::Value) -> Option<String> {
    let spec: VmSpec = serde_json::from_value(spec_json.clone()).ok()?;
    Some(fingerprint(&spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Lifecycle;

    fn base_spec() -> VmSpec {
        let mut spec = VmSpec::new("/images/vmlinux", "/images/web.ext4")
            .with_lifecycle(Lifecycle::Service)
            .with_resources(2, 512);
        spec.cmd = vec!["/bin/web".into(), "--port".into(), "4000".into()];
        spec.env.insert("PORT".into(), "4000".into());
        spec.env.insert("MIX_ENV".into(), "prod".into());
        spec
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(&base_spec()), fingerprint(&base_spec()));
    }

    #[test]
    fn test_fingerprint_is_uppercase_hex() {
        let f = fingerprint(&base_spec());
        assert_eq!(f.len(), 16);
        assert!(f.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        // Same spec, keys permuted at every level.
        let a: VmSpec = serde_json::from_str(
            r#"{
                "kernel": "/k", "rootfs": "/r",
                "env": {"A": "1", "B": "2"},
                "resources": {"vcpu": 1, "mem_mb": 256},
                "lifecycle": "service"
            }"#,
        )
        .unwrap();
        let b: VmSpec = serde_json::from_str(
            r#"{
                "lifecycle": "service",
                "resources": {"mem_mb": 256, "vcpu": 1},
                "env": {"B": "2", "A": "1"},
                "rootfs": "/r", "kernel": "/k"
            }"#,
        )
        .unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_specs() {
        let a = base_spec();
        let mut b = base_spec();
        b.env.insert("PORT".into(), "4001".into());
        assert_ne!(fingerprint(&a), fingerprint(&b));

        let mut c = base_spec();
        c.resources.mem_mb = 1024;
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_fingerprint_includes_extras() {
        let a = base_spec();
        let mut b = base_spec();
        b.extra
            .insert("region".into(), serde_json::Value::String("eu-west".into()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_cmd_order_matters() {
        // cmd is an ordered sequence, not a mapping.
        let mut a = base_spec();
        a.cmd = vec!["a".into(), "b".into()];
        let mut b = base_spec();
        b.cmd = vec!["b".into(), "a".into()];
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_json_roundtrip() {
        let spec = base_spec();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(fingerprint_json(&value), Some(fingerprint(&spec)));
    }
}
