use super::handlers::{health, jwks, refresh};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Documented routes. Anything registered outside this router, such as
/// `OPTIONS /health`, is served but absent from the `OpenAPI` document.
pub(crate) fn api_router() -> OpenApiRouter {
    OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(jwks::jwks))
        .routes(routes!(refresh::refresh))
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = primary_author(env!("CARGO_PKG_AUTHORS")).map(|(name, email)| {
        let mut contact = Contact::new();
        contact.name = name.map(str::to_string);
        contact.email = email.map(str::to_string);
        contact
    });
    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|spdx| {
        let mut license = License::new(spdx);
        license.identifier = Some(spdx.to_string());
        license
    });

    // Routes registered on top only add paths and schemas; tags come from
    // this base document.
    OpenApiBuilder::new()
        .info(info)
        .tags(Some(vec![
            tag("health", "Liveness of the store and the signing key"),
            tag("jwks", "Published token verification keys"),
            tag("auth", "Refresh token rotation"),
        ]))
        .build()
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

/// First entry of `CARGO_PKG_AUTHORS` (`;` separated) as `(name, email)`.
fn primary_author(authors: &str) -> Option<(Option<&str>, Option<&str>)> {
    let author = non_empty(authors.split(';').next()?)?;
    let parsed = match author.split_once('<') {
        Some((name, email)) => (non_empty(name), non_empty(email.trim_end_matches('>'))),
        None => (Some(author), None),
    };
    Some(parsed)
}
