use std::collections::HashMap;

/// Identifies a field's position in the script: its dotted path, its local
/// (undotted) name, and its nesting depth. Depth `-1` is reserved for the
/// synthetic root struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedFieldInfo {
    pub path: String,
    pub local_name: String,
    pub depth: i32,
}

impl NamedFieldInfo {
    #[must_use]
    pub fn root() -> Self {
        Self {
            path: String::new(),
            local_name: String::new(),
            depth: -1,
        }
    }

    /// An unaddressable placeholder for a field the script left unnamed.
    /// Shares its parent's path so it can never collide with a real lookup.
    #[must_use]
    pub fn unnamed(scope: &Self) -> Self {
        Self {
            path: scope.path.clone(),
            local_name: String::new(),
            depth: scope.depth + 1,
        }
    }

    #[must_use]
    pub fn child(&self, local_name: &str) -> Self {
        let path = if self.path.is_empty() {
            local_name.to_string()
        } else {
            format!("{}.{}", self.path, local_name)
        };
        Self {
            path,
            local_name: local_name.to_string(),
            depth: self.depth + 1,
        }
    }
}

/// A single atomic numeric/boolean value, tagged by the primitive type it
/// was read as. Variants carry their own width/user-tag where the script
/// language calls for one (`Bit`, `Var`, `Custom`).
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Bit { width: u8, value: u8 },
    Bool(bool),
    Byte(i32),
    UByte(i32),
    Short(i32),
    UShort(i32),
    Int(i32),
    Long(i64),
    Var(Box<Field>),
    Custom(Box<Field>),
}

impl Atom {
    /// Uniform numeric view, used by the `NamedNumericFieldMap` and by
    /// consumer code. Non-numeric `Var`/`Custom` payloads fall back to their
    /// own `as_i64`, if any.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Atom::Bit { value, .. } => Some(*value as i64),
            Atom::Bool(b) => Some(*b as i64),
            Atom::Byte(v) | Atom::UByte(v) | Atom::Short(v) | Atom::UShort(v) | Atom::Int(v) => {
                Some(*v as i64)
            }
            Atom::Long(v) => Some(*v),
            Atom::Var(f) | Atom::Custom(f) => f.as_i64(),
        }
    }
}

/// The closed set of value variants produced by the interpreter: a single
/// atomic value, a homogeneous array of atomics, a nested struct, or an
/// array of structs.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Atom(Atom),
    BitArray { width: u8, values: Vec<u8> },
    BoolArray(Vec<bool>),
    ByteArray(Vec<i32>),
    UByteArray(Vec<i32>),
    ShortArray(Vec<i32>),
    UShortArray(Vec<i32>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    VarArray(Vec<Field>),
    CustomArray(Vec<Field>),
    Struct(Struct),
    ArrayStruct(Vec<Struct>),
}

impl Field {
    #[must_use]
    pub fn is_struct(&self) -> bool {
        matches!(self, Field::Struct(_))
    }

    #[must_use]
    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            Field::Struct(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_array(&self) -> bool {
        !matches!(self, Field::Atom(_) | Field::Struct(_))
    }

    /// Length of any array-shaped field (including `ArrayStruct`); `None`
    /// for scalar atoms and plain structs.
    #[must_use]
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Field::Atom(_) | Field::Struct(_) => None,
            Field::BitArray { values, .. } => Some(values.len()),
            Field::BoolArray(v) => Some(v.len()),
            Field::ByteArray(v)
            | Field::UByteArray(v)
            | Field::ShortArray(v)
            | Field::UShortArray(v)
            | Field::IntArray(v) => Some(v.len()),
            Field::LongArray(v) => Some(v.len()),
            Field::VarArray(v) | Field::CustomArray(v) => Some(v.len()),
            Field::ArrayStruct(v) => Some(v.len()),
        }
    }

    /// Uniform numeric view for scalar atoms; arrays and structs have none.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Field::Atom(a) => a.as_i64(),
            _ => None,
        }
    }
}

/// An ordered sequence of fields belonging to one struct instance, plus the
/// name metadata of the struct itself. Struct equality is structural; field
/// order is preserved from the script.
#[derive(Debug, Clone, PartialEq)]
pub struct Struct {
    pub info: NamedFieldInfo,
    pub fields: Vec<(NamedFieldInfo, Field)>,
}

impl Struct {
    #[must_use]
    pub fn new(info: NamedFieldInfo) -> Self {
        Self {
            info,
            fields: Vec::new(),
        }
    }

    pub fn push(&mut self, info: NamedFieldInfo, field: Field) {
        self.fields.push((info, field));
    }

    /// Looks up a direct child by its local (undotted) name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(info, _)| info.local_name == name)
            .map(|(_, f)| f)
    }

    #[must_use]
    pub fn by_index(&self, index: usize) -> Option<&Field> {
        self.fields.get(index).map(|(_, f)| f)
    }

    /// Resolves a dotted path (e.g. `"Header.Width"`) relative to this
    /// struct, descending into nested `Struct` fields for each path segment.
    #[must_use]
    pub fn by_path(&self, path: &str) -> Option<&Field> {
        let mut current: Option<&Field> = None;
        let mut scope = self;
        for (i, segment) in path.split('.').enumerate() {
            let field = scope.by_name(segment)?;
            if i == path.split('.').count() - 1 {
                current = Some(field);
            } else {
                scope = field.as_struct()?;
            }
        }
        current
    }
}

/// Values the script references but did not itself produce, keyed by the
/// raw (undotted) name the expression used.
pub trait ExternalValueProvider {
    fn get(&self, name: &str) -> Option<i32>;
}

/// Live mapping from dotted field path to the last-read integer value of
/// that named numeric field during the current parse. Consulted by the
/// expression evaluator for array lengths, skip counts, align values, and
/// bit widths.
#[derive(Default)]
pub struct NamedNumericFieldMap {
    values: HashMap<String, i64>,
}

impl NamedNumericFieldMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, info: &NamedFieldInfo, value: i64) {
        self.values.insert(info.path.clone(), value);
    }

    /// Resolves a raw name against the current evaluation scope, walking
    /// outward: first the fully dotted path relative to `scope_path`, then
    /// shorter and shorter prefixes, finally the bare name at the root.
    #[must_use]
    pub fn resolve(&self, scope_path: &str, name: &str) -> Option<i64> {
        if name.contains('.') {
            return self.values.get(name).copied();
        }
        if scope_path.is_empty() {
            return self.values.get(name).copied();
        }
        let mut prefix = scope_path;
        loop {
            let candidate = format!("{prefix}.{name}");
            if let Some(v) = self.values.get(&candidate) {
                return Some(*v);
            }
            match prefix.rfind('.') {
                Some(idx) => prefix = &prefix[..idx],
                None => break,
            }
        }
        self.values.get(name).copied()
    }
}
