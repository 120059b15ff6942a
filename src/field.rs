//! Text field values and the bracket naming grammar.

use std::collections::BTreeMap;

/// Value collected for a text field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// A single value.
    Text(String),
    /// Values in arrival order, from repeated names or `name[]`.
    List(Vec<FieldValue>),
    /// Values keyed by the bracketed segment of `name[key]`.
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Returns the text when this is a single value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the values when this is a list.
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the entries when this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, FieldValue>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up an entry of a map value.
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.as_map().and_then(|entries| entries.get(key))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Append,
}

/// Splits `base[a][b]` into its base and segments.
///
/// Returns `None` when the name is not well-formed bracket syntax, in which
/// case the whole name is used as a literal key.
fn parse_name(name: &str) -> Option<(&str, Vec<Segment<'_>>)> {
    let open = name.find('[')?;
    let base = &name[..open];
    if base.is_empty() || base.contains(']') {
        return None;
    }

    let mut segments = Vec::new();
    let mut rest = &name[open..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        let key = &inner[..close];
        if key.contains('[') {
            return None;
        }
        segments.push(if key.is_empty() {
            Segment::Append
        } else {
            Segment::Key(key)
        });
        rest = &inner[close + 1..];
    }

    Some((base, segments))
}

/// Appends a text field to `fields` following the naming grammar.
pub(crate) fn append_field(fields: &mut BTreeMap<String, FieldValue>, name: &str, value: String) {
    let (base, segments) = parse_name(name).unwrap_or((name, Vec::new()));
    let existing = fields.remove(base);
    fields.insert(base.to_owned(), place(existing, &segments, value));
}

fn place(existing: Option<FieldValue>, path: &[Segment<'_>], value: String) -> FieldValue {
    let Some((head, rest)) = path.split_first() else {
        return merge_flat(existing, FieldValue::Text(value));
    };

    match head {
        Segment::Append => push_item(existing, place(None, rest, value)),
        Segment::Key(key) => {
            let mut entries = into_map(existing);
            let child = entries.remove(*key);
            entries.insert((*key).to_owned(), place(child, rest, value));
            FieldValue::Map(entries)
        }
    }
}

fn merge_flat(existing: Option<FieldValue>, value: FieldValue) -> FieldValue {
    match existing {
        None => value,
        Some(FieldValue::Text(text)) => FieldValue::List(vec![FieldValue::Text(text), value]),
        Some(FieldValue::List(mut values)) => {
            values.push(value);
            FieldValue::List(values)
        }
        Some(FieldValue::Map(mut entries)) => {
            let key = next_index(&entries);
            entries.insert(key, value);
            FieldValue::Map(entries)
        }
    }
}

/// `name[]` always yields a list, even for a single value.
fn push_item(existing: Option<FieldValue>, value: FieldValue) -> FieldValue {
    match existing {
        None => FieldValue::List(vec![value]),
        other => merge_flat(other, value),
    }
}

fn into_map(existing: Option<FieldValue>) -> BTreeMap<String, FieldValue> {
    match existing {
        None => BTreeMap::new(),
        Some(FieldValue::Map(entries)) => entries,
        Some(FieldValue::Text(text)) => BTreeMap::from([("0".to_owned(), FieldValue::Text(text))]),
        Some(FieldValue::List(values)) => values
            .into_iter()
            .enumerate()
            .map(|(index, value)| (index.to_string(), value))
            .collect(),
    }
}

fn next_index(entries: &BTreeMap<String, FieldValue>) -> String {
    (entries.len()..)
        .map(|index| index.to_string())
        .find(|key| !entries.contains_key(key))
        .unwrap_or_default()
}
