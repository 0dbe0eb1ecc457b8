/// Converts between source column names and target field names.
pub trait NameMapper: Send + Sync {
    /// Column name → field name.
    fn to_field(&self, column: &str) -> String;

    /// Field name → column name. Inverse of [`NameMapper::to_field`] for
    /// names produced by it.
    fn to_column(&self, field: &str) -> String;
}

/// Built-in naming conventions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameTransformation {
    /// Field names equal column names.
    #[default]
    Identity,
    /// `created_at` ↔ `CreatedAt`
    SnakeToPascal,
    /// `created_at` ↔ `createdAt`
    SnakeToCamel,
}

impl NameTransformation {
    /// Column names as Postgres conventionally spells them, fields in PascalCase.
    pub const FROM_POSTGRES: NameTransformation = NameTransformation::SnakeToPascal;
}

impl NameMapper for NameTransformation {
    fn to_field(&self, column: &str) -> String {
        match self {
            NameTransformation::Identity => column.to_string(),
            NameTransformation::SnakeToPascal => snake_to_pascal(column),
            NameTransformation::SnakeToCamel => snake_to_camel(column),
        }
    }

    fn to_column(&self, field: &str) -> String {
        match self {
            NameTransformation::Identity => field.to_string(),
            NameTransformation::SnakeToPascal | NameTransformation::SnakeToCamel => {
                to_snake_case(field)
            }
        }
    }
}

pub fn snake_to_pascal(s: &str) -> String {
    s.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

pub fn snake_to_camel(s: &str) -> String {
    let pascal = snake_to_pascal(s);
    let mut chars = pascal.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => pascal,
    }
}

/// `CreatedAt`, `createdAt` and `HTTPStatus` become `created_at`,
/// `created_at` and `http_status`.
pub fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p == '_' => false,
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}
