use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::crd::{Cluster, LetterCase, PasswordConfig};
use crate::resources::common::{
    ACCOUNT_NAME_LABEL, account_secret_name, component_labels, owner_reference,
};

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 32;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#&*";

/// Generate a random password following the account's password policy
///
/// The length is clamped to 8..=32; digits and symbols are capped so that
/// they fit, and the remaining characters are letters of the requested case.
pub fn generate_password(config: &PasswordConfig) -> String {
    let length = (config.length.max(0) as usize).clamp(MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH);
    let digits = (config.num_digits.max(0) as usize).min(length);
    let symbols = (config.num_symbols.max(0) as usize).min(length - digits);
    let letters = length - digits - symbols;

    let mut rng = rand::rng();
    let mut pick = |charset: &[u8], n: usize| -> Vec<u8> {
        (0..n)
            .map(|_| charset[rng.random_range(0..charset.len())])
            .collect()
    };

    let mut chars = Vec::with_capacity(length);
    chars.extend(pick(DIGITS, digits));
    chars.extend(pick(SYMBOLS, symbols));
    match config.letter_case {
        LetterCase::LowerCases => chars.extend(pick(LOWER, letters)),
        LetterCase::UpperCases => chars.extend(pick(UPPER, letters)),
        LetterCase::MixedCases => {
            let upper = letters / 2;
            chars.extend(pick(UPPER, upper));
            chars.extend(pick(LOWER, letters - upper));
        }
    }

    chars.shuffle(&mut rand::rng());
    chars.into_iter().map(char::from).collect()
}

/// Generate the secret holding a system account's credentials
pub fn generate_account_secret(
    cluster: &Cluster,
    comp_name: &str,
    account: &str,
    password: &str,
) -> Secret {
    let cluster_name = cluster.name_any();
    let mut labels = component_labels(&cluster_name, comp_name);
    labels.insert(ACCOUNT_NAME_LABEL.to_string(), account.to_string());

    let data = BTreeMap::from([
        (
            USERNAME_KEY.to_string(),
            ByteString(account.as_bytes().to_vec()),
        ),
        (
            PASSWORD_KEY.to_string(),
            ByteString(password.as_bytes().to_vec()),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(account_secret_name(&cluster_name, comp_name, account)),
            namespace: cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Read a key of a secret as UTF-8, from `data` or `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key).cloned()))
}
