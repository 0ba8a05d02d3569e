use url::Url;

use crate::error::ProvisionError;

/// Bot names must match `^[A-Za-z][A-Za-z0-9-]{2,35}$`: a leading letter
/// followed by 2 to 35 alphanumeric-or-hyphen characters.
pub fn bot_name(name: &str) -> Result<(), ProvisionError> {
    let mut chars = name.chars();
    let valid_head = chars.next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    let valid_tail = (3..=36).contains(&name.len())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid_head && valid_tail {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "bot name `{name}` must start with a letter followed by 2-35 alphanumeric or hyphen characters"
        )))
    }
}

/// Messaging endpoints must be absolute HTTPS URLs.
pub fn https_endpoint(endpoint: &str) -> Result<Url, ProvisionError> {
    let url = Url::parse(endpoint).map_err(|err| {
        ProvisionError::Validation(format!("endpoint `{endpoint}` is not a valid URL: {err}"))
    })?;
    if url.scheme() != "https" {
        return Err(ProvisionError::Validation(format!(
            "endpoint `{endpoint}` must use https"
        )));
    }
    Ok(url)
}

/// Secret validity is bounded to 1-5 years.
pub fn validity_years(years: u32) -> Result<(), ProvisionError> {
    if (1..=5).contains(&years) {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "secret validity must be between 1 and 5 years, got {years}"
        )))
    }
}
