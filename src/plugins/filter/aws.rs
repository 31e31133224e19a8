//! AWS response-reshaping filters for Jinja2 templates.
//!
//! These filters flatten the nested structures returned by AWS `describe-*`
//! calls into the lists and scalars playbooks consume directly.
//!
//! # Available Filters
//!
//! - `ec2_instance_info`: collect one attribute from every instance in a
//!   `describe-instances` response
//! - `get_subnets`: return an attribute of every subnet carrying a given tag
//! - `get_dns_zone`: select a Route53 hosted zone by name
//! - `rds_endpoint`: extract endpoint addresses from a `describe-db-instances`
//!   response
//!
//! # Examples
//!
//! ```jinja2
//! {{ ec2_result | ec2_instance_info('PrivateIpAddress') }}
//! {{ subnet_facts | get_subnets('Tier', 'private') }}
//! {{ route53_zones | get_dns_zone('example.com.') }}
//! {{ rds_result | rds_endpoint }}
//! ```

use minijinja::{Environment, Value};

/// Register all AWS filters with the given environment.
pub fn register_filters(env: &mut Environment<'static>) {
    env.add_filter("ec2_instance_info", ec2_instance_info);
    env.add_filter("get_subnets", get_subnets);
    env.add_filter("get_dns_zone", get_dns_zone);
    env.add_filter("rds_endpoint", rds_endpoint);
}

/// Collect one attribute from every instance in a `describe-instances`
/// response.
///
/// Walks `Reservations[*].Instances[*]` and returns the list of values under
/// `return_key`. Instances missing the key are skipped.
fn ec2_instance_info(value: Value, return_key: String) -> Value {
    let mut results = Vec::new();

    if let Ok(reservations) = value.get_attr("Reservations") {
        if let Ok(reservations) = reservations.try_iter() {
            for reservation in reservations {
                let Ok(instances) = reservation.get_attr("Instances") else {
                    continue;
                };
                let Ok(instances) = instances.try_iter() else {
                    continue;
                };
                for instance in instances {
                    if let Ok(attr) = instance.get_attr(&return_key) {
                        if !attr.is_undefined() {
                            results.push(attr);
                        }
                    }
                }
            }
        }
    }

    Value::from(results)
}

/// Return an attribute of every subnet whose `resource_tags` carry the given
/// tag key/value pair.
///
/// `return_key` defaults to `id`.
fn get_subnets(
    value: Value,
    tag_key: String,
    tag_value: String,
    return_key: Option<String>,
) -> Value {
    let return_key = return_key.unwrap_or_else(|| "id".to_string());
    let mut subnets = Vec::new();

    if let Ok(items) = value.try_iter() {
        for item in items {
            let Ok(tags) = item.get_attr("resource_tags") else {
                continue;
            };
            let matched = tags
                .get_attr(&tag_key)
                .map(|v| v.as_str() == Some(tag_value.as_str()))
                .unwrap_or(false);
            if matched {
                if let Ok(attr) = item.get_attr(&return_key) {
                    if !attr.is_undefined() {
                        subnets.push(attr);
                    }
                }
            }
        }
    }

    Value::from(subnets)
}

/// Select a Route53 hosted zone by name from a `list-hosted-zones` response.
///
/// Returns the whole zone object, or undefined when no zone matches. Note
/// that Route53 zone names carry a trailing dot.
fn get_dns_zone(value: Value, zone_name: String) -> Value {
    if let Ok(zones) = value.get_attr("HostedZones") {
        if let Ok(zones) = zones.try_iter() {
            for zone in zones {
                let matched = zone
                    .get_attr("Name")
                    .map(|n| n.as_str() == Some(zone_name.as_str()))
                    .unwrap_or(false);
                if matched {
                    return zone;
                }
            }
        }
    }

    Value::UNDEFINED
}

/// Extract instance endpoint addresses from a `describe-db-instances`
/// response.
///
/// Walks `DBInstances[*].Endpoint.Address`; instances without an endpoint
/// (still creating) are skipped.
fn rds_endpoint(value: Value) -> Value {
    let mut endpoints = Vec::new();

    if let Ok(instances) = value.get_attr("DBInstances") {
        if let Ok(instances) = instances.try_iter() {
            for instance in instances {
                let Ok(endpoint) = instance.get_attr("Endpoint") else {
                    continue;
                };
                if let Ok(address) = endpoint.get_attr("Address") {
                    if !address.is_undefined() {
                        endpoints.push(address);
                    }
                }
            }
        }
    }

    Value::from(endpoints)
}
