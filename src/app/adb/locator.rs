use std::path::Path;

use crate::app::error::AppError;

fn strip_wrapping_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Trims whitespace and one pair of wrapping quotes, as pasted shell paths often carry them.
pub fn normalize_command_path(value: &str) -> String {
    strip_wrapping_quotes(value.trim()).trim().to_string()
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

/// Bare program names are left to `PATH` lookup; explicit paths must exist.
pub fn validate_program(program: &str, trace_id: &str) -> Result<(), AppError> {
    if program.trim().is_empty() {
        return Err(AppError::validation("Program path is empty", trace_id));
    }
    let path = Path::new(program);
    if path.components().count() == 1 && !program.contains(std::path::MAIN_SEPARATOR) {
        return Ok(());
    }
    if path.is_dir() {
        return Err(AppError::validation(
            format!("{program} is a directory, expected an executable"),
            trace_id,
        ));
    }
    if !path.exists() {
        return Err(AppError::dependency(
            format!("Executable not found at {program}"),
            trace_id,
        ));
    }
    Ok(())
}
