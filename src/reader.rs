use std::{
    collections::HashMap,
    error::Error,
    fmt, fs,
    io::{self, BufRead, BufReader},
    path::Path,
};

use ndarray::Array2;
use serde::{de::DeserializeOwned, Deserialize};

use crate::sample::Posterior;

/// Failures while reading the training inputs, these are fatal for the run.
#[derive(Debug)]
pub enum ReaderError {
    Io(io::Error),
    Parse {
        line: usize,
        source: serde_json::Error,
    },
    Ragged {
        key: String,
        line: usize,
    },
}

impl fmt::Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderError::Io(e) => write!(f, "io error: {e}"),
            ReaderError::Parse { line, source } => write!(f, "line {line}: {source}"),
            ReaderError::Ragged { key, line } => {
                write!(f, "line {line}: feature matrix of {key} has rows of different length")
            }
        }
    }
}

impl Error for ReaderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReaderError::Io(e) => Some(e),
            ReaderError::Parse { source, .. } => Some(source),
            ReaderError::Ragged { .. } => None,
        }
    }
}

impl From<io::Error> for ReaderError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// A random-access table keyed by utterance identifier.
pub trait Lookup<V>: Send {
    fn lookup(&self, key: &str) -> Option<&V>;
}

impl<V: Send> Lookup<V> for HashMap<String, V> {
    fn lookup(&self, key: &str) -> Option<&V> {
        self.get(key)
    }
}

/// The stream of `(key, features)` pairs the producer walks through once.
pub type FeatureStream =
    Box<dyn Iterator<Item = Result<(String, Array2<f32>), ReaderError>> + Send>;

#[derive(Deserialize)]
struct FeatureRecord {
    key: String,
    feats: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct TableRecord<V> {
    key: String,
    value: V,
}

/// Reads feature matrices from a JSON-lines source, one `{"key": .., "feats": [[..], ..]}`
/// object per line. Blank lines are ignored.
pub struct JsonlFeatureReader<R> {
    lines: io::Lines<R>,
    line: usize,
}

impl<R: BufRead> JsonlFeatureReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }

    fn parse(&self, text: &str) -> Result<(String, Array2<f32>), ReaderError> {
        let line = self.line;
        let FeatureRecord { key, feats } =
            serde_json::from_str(text).map_err(|source| ReaderError::Parse { line, source })?;

        let rows = feats.len();
        let cols = feats.first().map_or(0, Vec::len);

        if feats.iter().any(|row| row.len() != cols) {
            return Err(ReaderError::Ragged { key, line });
        }

        let flat = feats.into_iter().flatten().collect();
        let feats = Array2::from_shape_vec((rows, cols), flat)
            .map_err(|_| ReaderError::Ragged {
                key: key.clone(),
                line,
            })?;

        Ok((key, feats))
    }
}

impl JsonlFeatureReader<BufReader<fs::File>> {
    /// Opens the JSON-lines file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReaderError> {
        Ok(Self::new(BufReader::new(fs::File::open(path)?)))
    }
}

impl<R: BufRead> Iterator for JsonlFeatureReader<R> {
    type Item = Result<(String, Array2<f32>), ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line += 1;

            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };

            if !text.trim().is_empty() {
                return Some(self.parse(&text));
            }
        }
    }
}

/// Loads a whole `{"key": .., "value": ..}` JSON-lines table in memory.
///
/// # Arguments
/// * `reader` - The source to read from.
///
/// # Returns
/// The table, or a `ReaderError` on the first unreadable line. Duplicated keys keep the
/// last value.
pub fn load_table<V, R>(reader: R) -> Result<HashMap<String, V>, ReaderError>
where
    V: DeserializeOwned,
    R: BufRead,
{
    let mut table = HashMap::new();

    for (i, text) in reader.lines().enumerate() {
        let text = text?;
        if text.trim().is_empty() {
            continue;
        }

        let record: TableRecord<V> = serde_json::from_str(&text)
            .map_err(|source| ReaderError::Parse { line: i + 1, source })?;
        table.insert(record.key, record.value);
    }

    Ok(table)
}

/// Same as `load_table` but reading from the file at `path`.
pub fn load_table_file<V: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<HashMap<String, V>, ReaderError> {
    load_table(BufReader::new(fs::File::open(path)?))
}

/// Every input the producer needs: the feature stream plus the lookup tables.
pub struct SampleSource {
    pub(crate) features: FeatureStream,
    pub(crate) targets: Box<dyn Lookup<Posterior>>,
    pub(crate) frame_weights: Option<Box<dyn Lookup<Vec<f32>>>>,
    pub(crate) utt_weights: Option<Box<dyn Lookup<f32>>>,
}

impl SampleSource {
    /// Creates a new `SampleSource` without weight tables, every frame weighs `1.0`.
    ///
    /// # Arguments
    /// * `features` - The sequential feature stream.
    /// * `targets` - The per-utterance target posteriors.
    pub fn new<I, L>(features: I, targets: L) -> Self
    where
        I: Iterator<Item = Result<(String, Array2<f32>), ReaderError>> + Send + 'static,
        L: Lookup<Posterior> + 'static,
    {
        Self {
            features: Box::new(features),
            targets: Box::new(targets),
            frame_weights: None,
            utt_weights: None,
        }
    }

    /// Sets the per-frame weight table, utterances missing from it get skipped.
    pub fn with_frame_weights<L: Lookup<Vec<f32>> + 'static>(mut self, table: L) -> Self {
        self.frame_weights = Some(Box::new(table));
        self
    }

    /// Sets the per-utterance weight table, utterances missing from it get skipped.
    pub fn with_utt_weights<L: Lookup<f32> + 'static>(mut self, table: L) -> Self {
        self.utt_weights = Some(Box::new(table));
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn reads_feature_matrices() {
        let input = r#"{"key": "a", "feats": [[1.0, 2.0], [3.0, 4.0]]}

{"key": "b", "feats": [[5.0, 6.0]]}
"#;

        let read: Vec<_> = JsonlFeatureReader::new(Cursor::new(input))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(read[0].0, "a");
        assert_eq!(read[0].1, ndarray::array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(read[1].1.dim(), (1, 2));
    }

    #[test]
    fn ragged_matrix_is_an_error() {
        let input = r#"{"key": "a", "feats": [[1.0, 2.0], [3.0]]}"#;
        let mut reader = JsonlFeatureReader::new(Cursor::new(input));

        assert!(matches!(
            reader.next(),
            Some(Err(ReaderError::Ragged { line: 1, .. }))
        ));
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let input = "{\"key\": \"a\", \"feats\": [[1.0]]}\nnot json\n";
        let mut reader = JsonlFeatureReader::new(Cursor::new(input));

        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(
            reader.next(),
            Some(Err(ReaderError::Parse { line: 2, .. }))
        ));
    }

    #[test]
    fn loads_posterior_tables() {
        let input = r#"{"key": "a", "value": [[[0, 1.0]], [[2, 0.5], [3, 0.5]]]}
{"key": "b", "value": [[[1, 1.0]]]}
"#;

        let table: HashMap<String, Posterior> = load_table(Cursor::new(input)).unwrap();

        assert_eq!(table.lookup("a").map(Vec::len), Some(2));
        assert_eq!(table.lookup("b"), Some(&vec![vec![(1, 1.0)]]));
        assert_eq!(table.lookup("c"), None);
    }

    #[test]
    fn loads_weight_tables() {
        let input = "{\"key\": \"a\", \"value\": 0.5}\n";
        let table: HashMap<String, f32> = load_table(Cursor::new(input)).unwrap();
        assert_eq!(table.lookup("a"), Some(&0.5));
    }
}
