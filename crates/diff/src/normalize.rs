//! Canonicalization applied to both sides before comparing.

use base64::Engine as _;
use k8s_openapi::api::{apps, autoscaling, batch, core, networking, policy, rbac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as Json};

/// Round-trip well-known kinds through their typed form so that defaulted and
/// reordered fields compare equal, then canonicalize resource quantities.
///
/// Unknown kinds are only quantity-normalized.
pub fn remarshal(v: &Json) -> Result<Json, serde_json::Error> {
    let api_version = v.get("apiVersion").and_then(|x| x.as_str()).unwrap_or("");
    let kind = v.get("kind").and_then(|x| x.as_str()).unwrap_or("");
    let mut out = match (api_version, kind) {
        ("apps/v1", "Deployment") => roundtrip::<apps::v1::Deployment>(v)?,
        ("apps/v1", "StatefulSet") => roundtrip::<apps::v1::StatefulSet>(v)?,
        ("apps/v1", "DaemonSet") => roundtrip::<apps::v1::DaemonSet>(v)?,
        ("apps/v1", "ReplicaSet") => roundtrip::<apps::v1::ReplicaSet>(v)?,
        ("v1", "Service") => roundtrip::<core::v1::Service>(v)?,
        ("v1", "ConfigMap") => roundtrip::<core::v1::ConfigMap>(v)?,
        ("v1", "Secret") => roundtrip::<core::v1::Secret>(v)?,
        ("v1", "Pod") => roundtrip::<core::v1::Pod>(v)?,
        ("v1", "ServiceAccount") => roundtrip::<core::v1::ServiceAccount>(v)?,
        ("v1", "Namespace") => roundtrip::<core::v1::Namespace>(v)?,
        ("v1", "PersistentVolumeClaim") => roundtrip::<core::v1::PersistentVolumeClaim>(v)?,
        ("batch/v1", "Job") => roundtrip::<batch::v1::Job>(v)?,
        ("batch/v1", "CronJob") => roundtrip::<batch::v1::CronJob>(v)?,
        ("networking.k8s.io/v1", "Ingress") => roundtrip::<networking::v1::Ingress>(v)?,
        ("rbac.authorization.k8s.io/v1", "Role") => roundtrip::<rbac::v1::Role>(v)?,
        ("rbac.authorization.k8s.io/v1", "RoleBinding") => roundtrip::<rbac::v1::RoleBinding>(v)?,
        ("rbac.authorization.k8s.io/v1", "ClusterRole") => roundtrip::<rbac::v1::ClusterRole>(v)?,
        ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => roundtrip::<rbac::v1::ClusterRoleBinding>(v)?,
        ("autoscaling/v2", "HorizontalPodAutoscaler") => roundtrip::<autoscaling::v2::HorizontalPodAutoscaler>(v)?,
        ("policy/v1", "PodDisruptionBudget") => roundtrip::<policy::v1::PodDisruptionBudget>(v)?,
        _ => v.clone(),
    };
    normalize_quantities(&mut out);
    Ok(out)
}

fn roundtrip<T: DeserializeOwned + Serialize>(v: &Json) -> Result<Json, serde_json::Error> {
    let typed: T = serde_json::from_value(v.clone())?;
    serde_json::to_value(typed)
}

const QUANTITY_MAPS: &[&str] = &["limits", "requests", "hard"];

fn normalize_quantities(v: &mut Json) {
    match v {
        Json::Object(map) => {
            for (k, child) in map.iter_mut() {
                if QUANTITY_MAPS.contains(&k.as_str()) {
                    if let Json::Object(q) = child {
                        canonicalize_map(q);
                        continue;
                    }
                }
                normalize_quantities(child);
            }
        }
        Json::Array(items) => items.iter_mut().for_each(normalize_quantities),
        _ => {}
    }
}

fn canonicalize_map(q: &mut Map<String, Json>) {
    for val in q.values_mut() {
        let raw = match val {
            Json::String(s) => s.clone(),
            Json::Number(n) => n.to_string(),
            _ => continue,
        };
        if let Some(c) = canonical_quantity(&raw) {
            *val = Json::String(c);
        }
    }
}

/// Exact decimal rendering of a Kubernetes quantity: `2Gi` and `2048Mi` both
/// become `2147483648`, `100m` becomes `0.1`.
pub fn canonical_quantity(s: &str) -> Option<String> {
    let s = s.trim();
    let split = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || ((*c == '+' || *c == '-') && *i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (mut mantissa, mut exp) = parse_decimal(number)?;

    let (factor, exp10): (i128, i32) = match suffix {
        "" => (1, 0),
        "Ki" => (1 << 10, 0),
        "Mi" => (1 << 20, 0),
        "Gi" => (1 << 30, 0),
        "Ti" => (1 << 40, 0),
        "Pi" => (1 << 50, 0),
        "Ei" => (1 << 60, 0),
        "n" => (1, -9),
        "u" => (1, -6),
        "m" => (1, -3),
        "k" => (1, 3),
        "M" => (1, 6),
        "G" => (1, 9),
        "T" => (1, 12),
        "P" => (1, 15),
        "E" => (1, 18),
        other => {
            let e = other.strip_prefix('e').or_else(|| other.strip_prefix('E'))?;
            (1, e.parse::<i32>().ok()?)
        }
    };
    mantissa = mantissa.checked_mul(factor)?;
    exp += exp10;

    if mantissa == 0 {
        return Some("0".to_string());
    }
    while mantissa % 10 == 0 {
        mantissa /= 10;
        exp += 1;
    }
    if exp >= 0 {
        if exp > 30 {
            return None;
        }
        let scaled = mantissa.checked_mul(10i128.checked_pow(exp as u32)?)?;
        return Some(scaled.to_string());
    }
    let frac = (-exp) as usize;
    let digits = mantissa.unsigned_abs().to_string();
    let sign = if mantissa < 0 { "-" } else { "" };
    if digits.len() <= frac {
        Some(format!("{}0.{}{}", sign, "0".repeat(frac - digits.len()), digits))
    } else {
        let (int, rest) = digits.split_at(digits.len() - frac);
        Some(format!("{}{}.{}", sign, int, rest))
    }
}

/// `"-1.25"` -> `(-125, -2)`.
fn parse_decimal(s: &str) -> Option<(i128, i32)> {
    let (neg, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (int, frac) = body.split_once('.').unwrap_or((body, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if int.len() + frac.len() > 30 || !int.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let digits = format!("{}{}", int, frac);
    let mut m: i128 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    if neg {
        m = -m;
    }
    Some((m, -(frac.len() as i32)))
}

/// Move `data` entries of the live Secret under `stringData` when the desired
/// Secret declares the same key there, so mixed declarations compare equal.
pub fn rebalance_secret(live: &mut Json, desired: &Json) {
    let Some(desired_string) = desired.get("stringData").and_then(|v| v.as_object()) else { return };
    let Some(obj) = live.as_object_mut() else { return };
    let mut moved: Vec<(String, String)> = Vec::new();
    if let Some(data) = obj.get("data").and_then(|v| v.as_object()) {
        let live_string = obj.get("stringData").and_then(|v| v.as_object());
        for (k, v) in data {
            if !desired_string.contains_key(k) || live_string.map(|m| m.contains_key(k)).unwrap_or(false) {
                continue;
            }
            let Some(encoded) = v.as_str() else { continue };
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(encoded) else { continue };
            let Ok(decoded) = String::from_utf8(bytes) else { continue };
            moved.push((k.clone(), decoded));
        }
    }
    if moved.is_empty() {
        return;
    }
    let mut data_empty = false;
    if let Some(Json::Object(data)) = obj.get_mut("data") {
        for (k, _) in &moved {
            data.remove(k);
        }
        data_empty = data.is_empty();
    }
    if data_empty {
        obj.remove("data");
    }
    let string_data = obj.entry("stringData").or_insert_with(|| Json::Object(Map::new()));
    if let Json::Object(sd) = string_data {
        for (k, v) in moved {
            sd.insert(k, Json::String(v));
        }
    }
}
