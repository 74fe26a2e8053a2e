// SPDX-License-Identifier: AGPL-3.0-only

//! Fehlerseiten des HTTP-Proxys. Die Illustration hängt an der
//! Statusklasse (2xx/4xx/5xx/sonst).

const ART_HAPPY: &str = "<svg viewBox='0 0 64 64' width='96'><circle cx='32' cy='32' r='30' fill='#7fd1b9'/><circle cx='24' cy='26' r='4' fill='#143'/><circle cx='40' cy='26' r='4' fill='#143'/><path d='M20 40 q12 10 24 0' stroke='#143' stroke-width='3' fill='none'/></svg>";
const ART_LOST: &str = "<svg viewBox='0 0 64 64' width='96'><circle cx='32' cy='32' r='30' fill='#f5c16c'/><circle cx='24' cy='26' r='4' fill='#431'/><circle cx='40' cy='26' r='4' fill='#431'/><path d='M20 44 q12 -8 24 0' stroke='#431' stroke-width='3' fill='none'/></svg>";
const ART_BROKEN: &str = "<svg viewBox='0 0 64 64' width='96'><circle cx='32' cy='32' r='30' fill='#e98074'/><path d='M20 22 l8 8 M28 22 l-8 8 M36 22 l8 8 M44 22 l-8 8' stroke='#411' stroke-width='3'/><path d='M20 46 h24' stroke='#411' stroke-width='3'/></svg>";
const ART_CONFUSED: &str = "<svg viewBox='0 0 64 64' width='96'><circle cx='32' cy='32' r='30' fill='#9db4c0'/><circle cx='24' cy='26' r='4' fill='#123'/><circle cx='40' cy='26' r='4' fill='#123'/><circle cx='32' cy='44' r='4' fill='#123'/></svg>";

fn image(code: u16) -> (&'static str, &'static str) {
    match code {
        200..=299 => (
            ART_HAPPY,
            "Welcome to your Web3 proxy. To learn how to publish your own \
             Web3 content visit <a href='https://diode.io'>diode.io</a>.",
        ),
        400..=499 => (
            ART_LOST,
            "Looks like you don't have access to this resource, or it may \
             be down.",
        ),
        500..=599 => (
            ART_BROKEN,
            "You found a bug. Please copy the URL and the message above and \
             file an issue with a short description of what happened.",
        ),
        _ => (ART_CONFUSED, "We have no idea what happened here."),
    }
}

/// Rendert die Fehlerseite.
pub fn page(title: &str, code: u16, code_message: &str, more: &str) -> String {
    let (art, hint) = image(code);
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset='utf-8'>\
         <title>{title}</title>\
         <style>body{{font-family:sans-serif;text-align:center;\
         margin-top:10vh;color:#233}}.code{{font-size:3em}}\
         .hint{{color:#567;max-width:32em;margin:1em auto}}</style>\
         </head>\n<body>\n{art}\n<div class='code'>{code}</div>\n\
         <h1>{code_message}</h1>\n<p>{more}</p>\n\
         <p class='hint'>{hint}</p>\n</body>\n</html>\n"
    )
}
