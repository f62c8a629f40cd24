use tracing::debug;
use url::Url;

use crate::model::Marketplace;

/// Lower-case a hostname and drop a leading `www.`.
pub fn normalize_host(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Normalized hostname of an absolute URL. Scheme-less input does not parse.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = normalize_host(parsed.host_str()?);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Find the marketplace a URL belongs to.
///
/// A candidate matches when either normalized hostname contains the other,
/// so `produto.mercadolivre.com.br` matches a marketplace registered as
/// `https://www.mercadolivre.com.br`. The first match in slice order wins;
/// there is no scoring. Inactive marketplaces and candidates whose base URL
/// does not parse are skipped.
pub fn resolve_marketplace<'a>(url: &str, marketplaces: &'a [Marketplace]) -> Option<&'a Marketplace> {
    let host = host_of(url)?;

    let found = marketplaces.iter().filter(|m| m.active).find(|m| {
        host_of(&m.base_url)
            .is_some_and(|candidate| host.contains(&candidate) || candidate.contains(&host))
    });
    match found {
        Some(m) => debug!(%host, marketplace = %m.name, "marketplace resolved"),
        None => debug!(%host, "no marketplace for host"),
    }
    found
}
