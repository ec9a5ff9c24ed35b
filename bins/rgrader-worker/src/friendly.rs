// Friendly error hints for common interpreter errors
use once_cell::sync::Lazy;
use regex::Regex;

/// Ordered (pattern, hint) table; the first match wins
static HINTS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"object '([^']*)' not found",
            "Undefined identifier: a variable or object is used before it is defined. Check the spelling and that it is assigned first.",
        ),
        (
            r#"could not find function "([^"]*)""#,
            "Missing function: the function is not defined. Check its name, define it, or load the library that provides it.",
        ),
        (
            r"unexpected (symbol|string constant|numeric constant|input|end of input|'[^']*')",
            "Syntax error: the code could not be parsed. Look for unbalanced brackets or quotes, or a missing operator or comma.",
        ),
        (
            r#"argument "([^"]*)" is missing, with no default"#,
            "Missing argument: a function was called without a required argument.",
        ),
        (
            r"subscript out of bounds",
            "Out of bounds: an index is outside the range of the vector, list or matrix.",
        ),
        (
            r"non-numeric argument to (binary operator|mathematical function)",
            "Type mismatch: a calculation received a value that is not numeric, such as text or a list.",
        ),
    ]
    .into_iter()
    .map(|(pattern, hint)| (Regex::new(pattern).expect("valid hint pattern"), hint))
    .collect()
});

/// Hint for a raw error message, if any pattern matches
pub fn hint_for(message: &str) -> Option<&'static str> {
    HINTS
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, hint)| *hint)
}

/// Prefix a matching hint to the message, keeping the original text
pub fn translate(message: &str) -> String {
    match hint_for(message) {
        Some(hint) => format!("{}\n\nOriginal error: {}", hint, message),
        None => message.to_string(),
    }
}
