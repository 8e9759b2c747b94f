//! CSS selectors for the portal UI
//!
//! The portal is not a contract we control, so every lookup is an ordered list
//! of candidates tried first to last. Only plain CSS is used: the same lists are
//! fed to the browser (`querySelector`) and to `scraper`.

/// Global search box on the dashboard header
pub const SEARCH_BOX_SELECTORS: &[&str] = &[
    "#pt1\\:svMenu\\:gsb\\:subFgsb\\:mGlobalSearch\\:pt_itG\\:\\:content",
    "input[id*='mGlobalSearch' i]",
    "div[role='search'] input",
    "input[aria-label*='Global Search' i]",
    "input[aria-label*='Search' i]",
    "input[placeholder*='Search' i]",
    "input[type='search']",
    "input[id*='search' i]",
    "input[name*='search' i]",
];

/// Elements that reveal or focus a collapsed search field
pub const SEARCH_TRIGGER_SELECTORS: &[&str] = &[
    "button[aria-label*='Search' i]",
    "a[aria-label*='Search' i]",
    "#pt1\\:svMenu\\:gsb\\:subFgsb\\:menu_pt_cil2\\:\\:icon",
];

pub const SEARCH_SUBMIT_SELECTORS: &[&str] = &[
    "#pt1\\:svMenu\\:gsb\\:subFgsb\\:menu_pt_cil2\\:\\:icon",
    "button[type='submit'][aria-label*='Search' i]",
];

/// Markers of the identity provider sign-in page
pub const LOGIN_PAGE_HINTS: &[&str] = &[
    "form#idcs-signin-basic-signin-form",
    "div[id*='idcs-signin' i]",
    "input[type='password']",
    "input[name='username']",
    "input[name='userid']",
];

pub const LOGIN_USERNAME_SELECTORS: &[&str] = &[
    "input[name='username']",
    "input[id*='username' i]",
    "input[type='email']",
    "#idcs-signin-basic-signin-form input[type='email']",
];

pub const LOGIN_PASSWORD_SELECTORS: &[&str] = &[
    "input[name='password']",
    "input[id*='password' i]",
    "#idcs-signin-basic-signin-form input[type='password']",
];

/// "Next" button of the two-step sign-in form
pub const LOGIN_NEXT_SELECTORS: &[&str] = &[
    "button[name='signInBtn']",
    "#idcs-signin-basic-signin-form button[type='submit']",
];

pub const LOGIN_SUBMIT_SELECTORS: &[&str] = &[
    "button[id*='signin' i]",
    "button[type='submit']",
    "#idcs-signin-basic-signin-form button[type='submit']",
];

/// Inline error shown when credentials are rejected
pub const LOGIN_ERROR_SELECTORS: &[&str] = &[
    "#idcs-signin-basic-signin-form [role='alert']",
    "div[id*='error' i][role='alert']",
    ".oj-message-error",
];

/// Multi-factor prompt waiting for out-of-band approval
pub const CHALLENGE_SELECTORS: &[&str] = &[
    "div[id*='idcs-mfa' i]",
    "form[id*='mfa' i]",
    "div[id*='push-notification' i]",
    "oj-idaas-signin-mfa",
];

/// Shown when a new push notification replaced the previous one
pub const CHALLENGE_RESENT_SELECTORS: &[&str] = &[
    "div[id*='mfa-resent' i]",
    "[data-idcs-mfa-state='resent']",
];

pub const CHALLENGE_DENIED_SELECTORS: &[&str] = &[
    "div[id*='mfa-denied' i]",
    "[data-idcs-mfa-state='denied']",
];

/// Result listing containers, most specific first
pub const RESULT_CONTAINER_SELECTORS: &[&str] = &[
    "table[summary*='Search Results' i]",
    "div[id*='kmSearchResults' i]",
    "div[id*='searchResults' i]",
    "ul.km-search-results",
    "div.search-results",
    "[role='list'][aria-label*='results' i]",
];

/// One entry inside a result container; structural classes win over bare data attributes
pub const RESULT_ENTRY_SELECTORS: &[&str] = &[
    "tr.km-result",
    "li.km-result",
    "div.km-result",
    "li.search-result",
    "div.search-result",
    "[role='listitem']",
    "[data-doc-id]",
    "[data-docid]",
    "tr",
];

pub const RESULT_LINK_SELECTORS: &[&str] = &[
    "a[href*='DocumentDisplay']",
    "a[href*='id=']",
    "a[href]",
];

pub const RESULT_SNIPPET_SELECTORS: &[&str] = &[
    ".km-result-snippet",
    "[class*='snippet' i]",
    "[class*='abstract' i]",
    "[class*='summary' i]",
    "p",
];

/// Markers of an empty but well-formed result view
pub const NO_RESULTS_SELECTORS: &[&str] = &[
    "div[id*='noResults' i]",
    ".km-no-results",
    "[data-empty-results]",
];

/// Phrases the portal uses on an empty result view
pub const NO_RESULTS_PHRASES: &[&str] = &[
    "no results found",
    "did not match any documents",
    "returned 0 results",
];

/// Document view body, most specific first
pub const DOCUMENT_BODY_SELECTORS: &[&str] = &[
    "div[id*='docBody' i]",
    "div.km-doc-body",
    "div[id*='kmPgTpl' i] article",
    "article",
    "main",
    "body",
];

pub const DOCUMENT_TITLE_SELECTORS: &[&str] = &[
    "div[id*='docTitle' i]",
    "h1.km-doc-title",
    "h1",
    "title",
];

/// Anything that proves a view finished rendering search results
pub fn search_ready_selectors() -> impl Iterator<Item = &'static str> {
    RESULT_CONTAINER_SELECTORS
        .iter()
        .chain(NO_RESULTS_SELECTORS.iter())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Selector;

    #[test]
    fn test_all_selectors_parse() {
        let lists: &[&[&str]] = &[
            SEARCH_BOX_SELECTORS,
            SEARCH_TRIGGER_SELECTORS,
            SEARCH_SUBMIT_SELECTORS,
            LOGIN_PAGE_HINTS,
            LOGIN_USERNAME_SELECTORS,
            LOGIN_PASSWORD_SELECTORS,
            LOGIN_NEXT_SELECTORS,
            LOGIN_SUBMIT_SELECTORS,
            LOGIN_ERROR_SELECTORS,
            CHALLENGE_SELECTORS,
            CHALLENGE_RESENT_SELECTORS,
            CHALLENGE_DENIED_SELECTORS,
            RESULT_CONTAINER_SELECTORS,
            RESULT_ENTRY_SELECTORS,
            RESULT_LINK_SELECTORS,
            RESULT_SNIPPET_SELECTORS,
            NO_RESULTS_SELECTORS,
            DOCUMENT_BODY_SELECTORS,
            DOCUMENT_TITLE_SELECTORS,
        ];
        for list in lists {
            for selector in *list {
                assert!(Selector::parse(selector).is_ok(), "selector does not parse: {selector}");
            }
        }
    }
}
