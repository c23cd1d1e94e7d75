//! Store path layout shared with the frontend drivers.
//!
//! The layout is part of the xenbus protocol and must match byte for byte:
//!
//! ```text
//! /local/domain/<beDomId>/backend/<class>/<feDomId>/<devId>   backend root
//! /local/domain/<feDomId>/device/<class>/<devId>              frontend root
//! <root>/state                                                 xenbus state
//! ```

pub const STATE_LEAF: &str = "state";

pub fn domain_path(dom_id: u16) -> String {
    format!("/local/domain/{dom_id}")
}

pub fn backend_path(
    be_dom_id: u16,
    device_class: &str,
    fe_dom_id: u16,
    dev_id: u16,
) -> String {
    format!(
        "{}/backend/{device_class}/{fe_dom_id}/{dev_id}",
        domain_path(be_dom_id)
    )
}

pub fn frontend_path(
    fe_dom_id: u16,
    device_class: &str,
    dev_id: u16,
) -> String {
    format!("{}/device/{device_class}/{dev_id}", domain_path(fe_dom_id))
}

pub fn state_path(root: &str) -> String {
    format!("{root}/{STATE_LEAF}")
}

/// True if `child` is `parent` or lies below it, compared per path component.
pub fn is_subpath(
    parent: &str,
    child: &str,
) -> bool {
    let parent = parent.trim_end_matches('/');
    match child.strip_prefix(parent) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || parent.is_empty(),
        None => false,
    }
}
