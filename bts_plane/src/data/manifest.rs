use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{Error, Result};

/// One utterance from the dataset manifest.
///
/// `ilen`/`olen`/`idim`/`odim` are kept exactly as declared by the manifest,
/// which describes the recognition direction: `ilen` counts feature frames and
/// `olen` counts tokens. The token to feature model runs the other way, so
/// [`UtteranceRecord::token_len`] reads `olen` and
/// [`UtteranceRecord::frame_len`] reads `ilen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtteranceRecord {
    pub id: String,
    pub feat: Option<String>,
    pub tokens: Vec<usize>,
    pub ilen: usize,
    pub olen: usize,
    pub idim: usize,
    pub odim: usize,
}

impl UtteranceRecord {
    pub fn token_len(&self) -> usize {
        self.olen
    }

    pub fn frame_len(&self) -> usize {
        self.ilen
    }

    /// End-of-sequence id: last entry of the declared token vocabulary.
    pub fn eos(&self) -> Result<usize> {
        self.odim.checked_sub(1).ok_or_else(|| {
            Error::Manifest(format!("utterance '{}' declares an empty output vocabulary", self.id))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InputInfo {
    #[serde(default)]
    feat: Option<String>,
    #[serde(default)]
    shape: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutputInfo {
    #[serde(default)]
    shape: Vec<usize>,
    #[serde(default)]
    tokenid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DeclaredLen {
    Num(usize),
    Str(String),
}

impl DeclaredLen {
    fn parse(&self, id: &str, field: &str) -> Result<usize> {
        match self {
            DeclaredLen::Num(x) => Ok(*x),
            DeclaredLen::Str(x) => x.trim().parse().map_err(|_| {
                Error::Manifest(format!("utterance '{id}' has non-integer {field}: '{x}'"))
            }),
        }
    }
}

/// Accepts both the nested `input`/`output` layout and the flat layout with
/// top level `feat`, `tokenid`, `ilen`, `olen`, `idim` and `odim` keys.
#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    #[serde(default)]
    input: Vec<InputInfo>,
    #[serde(default)]
    output: Vec<OutputInfo>,
    #[serde(default)]
    feat: Option<String>,
    #[serde(default)]
    tokenid: Option<String>,
    #[serde(default)]
    ilen: Option<DeclaredLen>,
    #[serde(default)]
    olen: Option<DeclaredLen>,
    #[serde(default)]
    idim: Option<DeclaredLen>,
    #[serde(default)]
    odim: Option<DeclaredLen>,
}

impl RawRecord {
    fn into_record(self, id: String) -> Result<UtteranceRecord> {
        let input = self.input.first();
        let output = self.output.first();

        let feat = self.feat.clone().or_else(|| input.and_then(|x| x.feat.clone()));
        let tokenid = self
            .tokenid
            .clone()
            .or_else(|| output.and_then(|x| x.tokenid.clone()))
            .ok_or_else(|| Error::Manifest(format!("utterance '{id}' has no tokenid")))?;
        let tokens = parse_token_ids(&tokenid)
            .map_err(|token| Error::Manifest(format!("utterance '{id}' has bad token id '{token}'")))?;

        let declared = |value: &Option<DeclaredLen>, field: &str, fallback: Option<usize>| {
            match value {
                Some(value) => value.parse(&id, field),
                None => fallback
                    .ok_or_else(|| Error::Manifest(format!("utterance '{id}' has no {field}"))),
            }
        };
        let ilen = declared(&self.ilen, "ilen", input.and_then(|x| x.shape.first().copied()))?;
        let olen = declared(
            &self.olen,
            "olen",
            output.and_then(|x| x.shape.first().copied()).or(Some(tokens.len())),
        )?;
        let idim = declared(&self.idim, "idim", input.and_then(|x| x.shape.get(1).copied()))?;
        let odim = declared(&self.odim, "odim", output.and_then(|x| x.shape.get(1).copied()))?;

        Ok(UtteranceRecord {
            id,
            feat,
            tokens,
            ilen,
            olen,
            idim,
            odim,
        })
    }
}

pub fn parse_token_ids(tokenid: &str) -> std::result::Result<Vec<usize>, String> {
    tokenid
        .split_whitespace()
        .map(|x| x.parse::<usize>().map_err(|_| x.to_string()))
        .collect()
}

/// Immutable utterance index, ordered by utterance id.
#[derive(Debug, Clone, Default)]
pub struct DatasetIndex {
    records: Vec<Arc<UtteranceRecord>>,
}

impl DatasetIndex {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading utterance manifest from path: {}", path.display());
        let file = File::open(path)?;
        let value: Value = serde_json::from_reader(BufReader::new(file))?;
        let index = Self::from_value(value)?;
        info!("# utts: {}", index.len());
        Ok(index)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    fn from_value(mut value: Value) -> Result<Self> {
        let utts = match value.get_mut("utts") {
            Some(utts) => utts.take(),
            None => return Err(Error::Manifest("missing top level 'utts' key".to_string())),
        };
        let utts = match utts {
            Value::Object(utts) => utts,
            _ => return Err(Error::Manifest("'utts' must be an object".to_string())),
        };

        let records = utts
            .into_iter()
            .map(|(id, raw)| {
                let raw: RawRecord = serde_json::from_value(raw)?;
                raw.into_record(id).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { records })
    }

    pub fn from_records<I: IntoIterator<Item = UtteranceRecord>>(records: I) -> Self {
        Self {
            records: records.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Arc<UtteranceRecord>] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<UtteranceRecord>> {
        self.records.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<UtteranceRecord>> {
        self.records.iter().find(|x| x.id == id)
    }

    /// Declared `(idim, odim)` of the first utterance.
    pub fn declared_dims(&self) -> Result<(usize, usize)> {
        let first = self
            .records
            .first()
            .ok_or_else(|| Error::Manifest("manifest has no utterances".to_string()))?;
        Ok((first.idim, first.odim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED: &str = r#"{"utts": {
        "utt_b": {
            "input": [{"feat": "feats.ark:0", "name": "input1", "shape": [120, 83]}],
            "output": [{"name": "target1", "shape": [4, 52], "tokenid": "3 9 12 7"}]
        },
        "utt_a": {
            "ilen": "80", "olen": "2", "idim": "83", "odim": "52",
            "feat": "feats.ark:100", "tokenid": "5 6"
        }
    }}"#;

    #[test]
    fn manifest_accepts_nested_and_flat_records() {
        let index = DatasetIndex::from_json_str(NESTED).unwrap();
        assert_eq!(index.len(), 2);

        let utt_b = index.get("utt_b").unwrap();
        assert_eq!(utt_b.tokens, vec![3, 9, 12, 7]);
        assert_eq!((utt_b.ilen, utt_b.olen, utt_b.idim, utt_b.odim), (120, 4, 83, 52));
        assert_eq!(utt_b.feat.as_deref(), Some("feats.ark:0"));
        assert_eq!(utt_b.eos().unwrap(), 51);

        let utt_a = index.get("utt_a").unwrap();
        assert_eq!((utt_a.ilen, utt_a.olen), (80, 2));
        assert_eq!(utt_a.token_len(), 2);
        assert_eq!(utt_a.frame_len(), 80);
    }

    #[test]
    fn manifest_orders_records_by_id() {
        let index = DatasetIndex::from_json_str(NESTED).unwrap();
        let ids: Vec<_> = index.iter().map(|x| x.id.as_str()).collect();
        assert_eq!(ids, vec!["utt_a", "utt_b"]);
        assert_eq!(index.declared_dims().unwrap(), (83, 52));
    }

    #[test]
    fn manifest_rejects_bad_token_ids() {
        let json = r#"{"utts": {"x": {"ilen": 1, "olen": 1, "idim": 2, "odim": 3, "tokenid": "1 a"}}}"#;
        let err = DatasetIndex::from_json_str(json).unwrap_err();
        assert!(matches!(err, Error::Manifest(_)));
    }

    #[test]
    fn manifest_requires_utts_key() {
        assert!(DatasetIndex::from_json_str("{}").is_err());
    }
}
