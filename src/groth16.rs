//! Groth16 / BN254 codec for snarkjs-formatted artifacts.
//!
//! Keys and proofs arrive as the JSON produced by `snarkjs zkey export
//! verificationkey` and `snarkjs groth16 prove`: field elements are decimal
//! strings, G1 points are `[x, y, z]` and G2 points are `[[x0, x1], [y0, y1],
//! [z0, z1]]` with `z` either one (affine) or zero (point at infinity).
//!
//! All parsing errors are returned as plain strings; the caller decides
//! whether they are a key-load failure or a malformed proof.

use std::str::FromStr;

use ark_bn254::{Bn254, Fq, Fq2, Fr, G1Affine, G2Affine};
use ark_ec::AffineRepr;
use ark_ff::PrimeField;
use ark_groth16::{Proof, VerifyingKey};
use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct SnarkjsVerificationKey {
    protocol: String,
    #[serde(default)]
    curve: Option<String>,
    #[serde(rename = "nPublic")]
    n_public: usize,
    vk_alpha_1: Vec<Value>,
    vk_beta_2: Vec<Vec<Value>>,
    vk_gamma_2: Vec<Vec<Value>>,
    vk_delta_2: Vec<Vec<Value>>,
    #[serde(rename = "IC")]
    ic: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SnarkjsProof {
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    curve: Option<String>,
    pi_a: Vec<Value>,
    pi_b: Vec<Vec<Value>>,
    pi_c: Vec<Value>,
}

/// A verifying key decoded from `verification_key.json`.
#[derive(Debug, Clone)]
pub struct DecodedKey {
    pub vk: VerifyingKey<Bn254>,
    pub n_public: usize,
}

/// Decode snarkjs `verification_key.json` bytes.
pub fn decode_verifying_key(bytes: &[u8]) -> Result<DecodedKey, String> {
    let raw: SnarkjsVerificationKey = serde_json::from_slice(bytes)
        .map_err(|e| format!("Failed to parse verification key JSON: {}", e))?;

    if raw.protocol != "groth16" {
        return Err(format!("Unsupported proof protocol: {}", raw.protocol));
    }
    check_curve(raw.curve.as_deref())?;

    if raw.ic.len() != raw.n_public + 1 {
        return Err(format!(
            "IC has {} points but nPublic is {} (expected {})",
            raw.ic.len(),
            raw.n_public,
            raw.n_public + 1
        ));
    }

    let gamma_abc_g1 = raw
        .ic
        .iter()
        .enumerate()
        .map(|(i, point)| decode_g1(&format!("IC[{}]", i), point))
        .collect::<Result<Vec<_>, _>>()?;

    let vk = VerifyingKey {
        alpha_g1: decode_g1("vk_alpha_1", &raw.vk_alpha_1)?,
        beta_g2: decode_g2("vk_beta_2", &raw.vk_beta_2)?,
        gamma_g2: decode_g2("vk_gamma_2", &raw.vk_gamma_2)?,
        delta_g2: decode_g2("vk_delta_2", &raw.vk_delta_2)?,
        gamma_abc_g1,
    };

    Ok(DecodedKey {
        vk,
        n_public: raw.n_public,
    })
}

/// Decode a snarkjs proof object (`{pi_a, pi_b, pi_c, protocol}`).
pub fn decode_proof(value: &Value) -> Result<Proof<Bn254>, String> {
    let raw: SnarkjsProof = serde_json::from_value(value.clone())
        .map_err(|e| format!("Proof is not a Groth16 proof object: {}", e))?;

    if let Some(protocol) = raw.protocol.as_deref() {
        if protocol != "groth16" {
            return Err(format!("Unsupported proof protocol: {}", protocol));
        }
    }
    check_curve(raw.curve.as_deref())?;

    Ok(Proof {
        a: decode_g1("pi_a", &raw.pi_a)?,
        b: decode_g2("pi_b", &raw.pi_b)?,
        c: decode_g1("pi_c", &raw.pi_c)?,
    })
}

/// Decode public signals into scalar field elements.
///
/// Returns `Ok(None)` when a signal is a well-formed integer that does not fit
/// in the scalar field: such a statement can never verify.
pub fn decode_public_signals(signals: &[Value]) -> Result<Option<Vec<Fr>>, String> {
    let mut inputs = Vec::with_capacity(signals.len());
    for (i, signal) in signals.iter().enumerate() {
        let digits = decimal_digits(&format!("publicSignals[{}]", i), signal)?;
        match reduce_checked::<Fr>(&digits)? {
            Some(fr) => inputs.push(fr),
            None => return Ok(None),
        }
    }
    Ok(Some(inputs))
}

fn check_curve(curve: Option<&str>) -> Result<(), String> {
    match curve {
        None => Ok(()),
        Some(c) if c.eq_ignore_ascii_case("bn128") || c.eq_ignore_ascii_case("bn254") => Ok(()),
        Some(c) => Err(format!("Unsupported curve: {}", c)),
    }
}

/// Accept decimal strings and non-negative JSON integers.
fn decimal_digits(field: &str, value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            Ok(s.clone())
        }
        Value::Number(n) => n
            .as_u64()
            .map(|v| v.to_string())
            .ok_or_else(|| format!("{}: expected a non-negative integer, got {}", field, n)),
        other => Err(format!("{}: expected a decimal string, got {}", field, other)),
    }
}

/// Parse a decimal integer, returning `None` if it is not below the modulus.
fn reduce_checked<F: PrimeField>(digits: &str) -> Result<Option<F>, String> {
    let value =
        BigUint::from_str(digits).map_err(|e| format!("Invalid integer {}: {}", digits, e))?;
    let modulus: BigUint = F::MODULUS.into();
    if value >= modulus {
        return Ok(None);
    }
    Ok(Some(F::from(value)))
}

fn base_field(field: &str, value: &Value) -> Result<Fq, String> {
    let digits = decimal_digits(field, value)?;
    reduce_checked::<Fq>(&digits)?
        .ok_or_else(|| format!("{}: coordinate exceeds the base field modulus", field))
}

fn projective_flag(field: &str, value: Option<&Value>) -> Result<bool, String> {
    match value {
        None => Ok(false),
        Some(z) => match decimal_digits(field, z)?.as_str() {
            "1" => Ok(false),
            "0" => Ok(true),
            other => Err(format!("{}: unsupported projective z = {}", field, other)),
        },
    }
}

fn decode_g1(field: &str, coords: &[Value]) -> Result<G1Affine, String> {
    if coords.len() != 2 && coords.len() != 3 {
        return Err(format!("{}: expected 2 or 3 coordinates, got {}", field, coords.len()));
    }
    if projective_flag(field, coords.get(2))? {
        return Ok(G1Affine::zero());
    }

    let x = base_field(field, &coords[0])?;
    let y = base_field(field, &coords[1])?;
    let point = G1Affine::new_unchecked(x, y);
    if !point.is_on_curve() {
        return Err(format!("{}: point is not on the BN254 G1 curve", field));
    }
    if !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(format!("{}: point is not in the G1 subgroup", field));
    }
    Ok(point)
}

fn decode_fq2(field: &str, pair: &[Value]) -> Result<Fq2, String> {
    if pair.len() != 2 {
        return Err(format!("{}: expected [c0, c1], got {} elements", field, pair.len()));
    }
    Ok(Fq2::new(base_field(field, &pair[0])?, base_field(field, &pair[1])?))
}

fn decode_g2(field: &str, coords: &[Vec<Value>]) -> Result<G2Affine, String> {
    if coords.len() != 2 && coords.len() != 3 {
        return Err(format!("{}: expected 2 or 3 coordinates, got {}", field, coords.len()));
    }
    if let Some(z) = coords.get(2) {
        let z = decode_fq2(field, z)?;
        if z == Fq2::from(0u64) {
            return Ok(G2Affine::zero());
        }
        if z != Fq2::from(1u64) {
            return Err(format!("{}: unsupported projective z", field));
        }
    }

    let x = decode_fq2(field, &coords[0])?;
    let y = decode_fq2(field, &coords[1])?;
    let point = G2Affine::new_unchecked(x, y);
    if !point.is_on_curve() {
        return Err(format!("{}: point is not on the BN254 G2 curve", field));
    }
    if !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(format!("{}: point is not in the G2 subgroup", field));
    }
    Ok(point)
}
