//! Maps free-text docker, docker-compose and kubectl commands onto canonical
//! skill keys, so "docker container ls -a" and "docker ps" count as one skill.

use regex::Regex;
use std::sync::LazyLock;

// (canonical key, anchored patterns). Matching is case-insensitive on a
// trimmed command; the longest match across the whole table wins.
const COMMAND_TABLE: &[(&str, &[&str])] = &[
    ("docker_run", &[r"^docker\s+run\b", r"^docker\s+container\s+run\b"]),
    (
        "docker_ps",
        &[r"^docker\s+ps\b", r"^docker\s+container\s+(ls|list)\b"],
    ),
    ("docker_stop", &[r"^docker\s+stop\b", r"^docker\s+container\s+stop\b"]),
    (
        "docker_rm",
        &[r"^docker\s+rm\b", r"^docker\s+container\s+(rm|remove)\b"],
    ),
    ("docker_exec", &[r"^docker\s+exec\b", r"^docker\s+container\s+exec\b"]),
    ("docker_logs", &[r"^docker\s+logs\b", r"^docker\s+container\s+logs\b"]),
    (
        "docker_inspect",
        &[r"^docker\s+inspect\b", r"^docker\s+container\s+inspect\b"],
    ),
    ("docker_build", &[r"^docker\s+build\b", r"^docker\s+image\s+build\b"]),
    ("docker_pull", &[r"^docker\s+pull\b", r"^docker\s+image\s+pull\b"]),
    ("docker_push", &[r"^docker\s+push\b", r"^docker\s+image\s+push\b"]),
    (
        "docker_images",
        &[r"^docker\s+images\b", r"^docker\s+image\s+(ls|list)\b"],
    ),
    (
        "docker_rmi",
        &[r"^docker\s+rmi\b", r"^docker\s+image\s+(rm|remove)\b"],
    ),
    ("docker_tag", &[r"^docker\s+tag\b", r"^docker\s+image\s+tag\b"]),
    ("docker_volume_create", &[r"^docker\s+volume\s+create\b"]),
    ("docker_volume_ls", &[r"^docker\s+volume\s+(ls|list)\b"]),
    ("docker_volume_rm", &[r"^docker\s+volume\s+(rm|remove)\b"]),
    ("docker_network_create", &[r"^docker\s+network\s+create\b"]),
    ("docker_network_ls", &[r"^docker\s+network\s+(ls|list)\b"]),
    ("docker_network_rm", &[r"^docker\s+network\s+(rm|remove)\b"]),
    ("docker_compose_up", &[r"^docker(-|\s+)compose\s+up\b"]),
    ("docker_compose_down", &[r"^docker(-|\s+)compose\s+down\b"]),
    ("docker_compose_build", &[r"^docker(-|\s+)compose\s+build\b"]),
    ("docker_compose_ps", &[r"^docker(-|\s+)compose\s+ps\b"]),
    ("kubectl_get_pods", &[r"^kubectl\s+get\s+(pods?|po)\b"]),
    ("kubectl_describe_pod", &[r"^kubectl\s+describe\s+(pods?|po)\b"]),
    ("kubectl_delete_pod", &[r"^kubectl\s+delete\s+(pods?|po)\b"]),
    ("kubectl_logs", &[r"^kubectl\s+logs\b"]),
    ("kubectl_exec", &[r"^kubectl\s+exec\b"]),
    ("kubectl_port_forward", &[r"^kubectl\s+port-forward\b"]),
    (
        "kubectl_create_deployment",
        &[r"^kubectl\s+create\s+(deployment|deploy)\b"],
    ),
    (
        "kubectl_get_deployments",
        &[r"^kubectl\s+get\s+(deployments?|deploy)\b"],
    ),
    ("kubectl_scale", &[r"^kubectl\s+scale\b"]),
    ("kubectl_rollout", &[r"^kubectl\s+rollout\b"]),
    ("kubectl_set_image", &[r"^kubectl\s+set\s+image\b"]),
    ("kubectl_expose", &[r"^kubectl\s+expose\b"]),
    ("kubectl_get_services", &[r"^kubectl\s+get\s+(services?|svc)\b"]),
    ("kubectl_create_configmap", &[r"^kubectl\s+create\s+(configmap|cm)\b"]),
    ("kubectl_create_secret", &[r"^kubectl\s+create\s+secret\b"]),
    ("kubectl_apply", &[r"^kubectl\s+apply\b"]),
    ("kubectl_get", &[r"^kubectl\s+get\b"]),
    ("kubectl_describe", &[r"^kubectl\s+describe\b"]),
    ("kubectl_delete", &[r"^kubectl\s+delete\b"]),
    ("kubectl_edit", &[r"^kubectl\s+edit\b"]),
];

static PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    COMMAND_TABLE
        .iter()
        .flat_map(|(key, patterns)| {
            patterns.iter().map(move |p| {
                let re = Regex::new(&format!("(?i){}", p)).expect("valid regex");
                (*key, re)
            })
        })
        .collect()
});

static BACKTICK_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("valid regex"));

static MENTIONS_TOOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)docker|kubectl").expect("valid regex"));

static STRUCTURAL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("valid regex"));

/// Canonical key for a raw command, or `None` when it is not a recognizable
/// docker/kubectl command.
pub fn canonicalize(raw: &str) -> Option<String> {
    let cleaned = clean(raw);
    if cleaned.is_empty() {
        return None;
    }

    let best = PATTERNS
        .iter()
        .filter_map(|(key, re)| re.find(&cleaned).map(|m| (m.end(), *key)))
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)));

    match best {
        Some((_, key)) => Some(key.to_string()),
        None => structural(&cleaned),
    }
}

// Lowercase, trim, and drop a leading shell prompt or sudo.
fn clean(raw: &str) -> String {
    let mut cleaned = raw.trim().to_lowercase();
    for prefix in ["$ ", "# ", "sudo "] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim_start().to_string();
        }
    }
    cleaned
}

fn structural(cleaned: &str) -> Option<String> {
    let words: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|w| !w.starts_with('-'))
        .collect();

    let (prefix, rest) = match words.as_slice() {
        ["docker-compose", rest @ ..] | ["docker", "compose", rest @ ..] => {
            ("docker_compose", &rest[..rest.len().min(1)])
        }
        ["docker", rest @ ..] => ("docker", &rest[..rest.len().min(2)]),
        ["kubectl", rest @ ..] => ("kubectl", &rest[..rest.len().min(2)]),
        _ => return None,
    };

    let parts: Vec<String> = rest
        .iter()
        .take_while(|w| STRUCTURAL_TOKEN.is_match(w))
        .map(|w| w.replace('-', "_"))
        .collect();

    if parts.is_empty() {
        return None;
    }
    Some(format!("{}_{}", prefix, parts.join("_")))
}

pub fn is_valid(raw: &str) -> bool {
    canonicalize(raw).is_some()
}

pub fn category(key: &str) -> &'static str {
    if key.starts_with("docker_compose_") {
        "docker-compose"
    } else if key.starts_with("docker_") {
        "docker"
    } else if key.starts_with("kubectl_") {
        "kubernetes"
    } else {
        "other"
    }
}

/// "docker_compose_up" becomes "Docker-compose Up".
pub fn label(key: &str) -> String {
    key.replace('_', " ")
        .replace("docker compose", "docker-compose")
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Known canonical keys in a category.
pub fn commands_for_category(category_name: &str) -> Vec<&'static str> {
    COMMAND_TABLE
        .iter()
        .map(|(key, _)| *key)
        .filter(|key| category(key) == category_name)
        .collect()
}

/// Canonical keys mentioned in lesson text, via backtick spans and the
/// first tool mention on each line. First occurrence order, no duplicates.
pub fn extract_commands(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut push = |key: Option<String>| {
        if let Some(key) = key {
            if !found.contains(&key) {
                found.push(key);
            }
        }
    };

    for caps in BACKTICK_SPAN.captures_iter(text) {
        push(canonicalize(&caps[1]));
    }
    for line in text.lines() {
        if let Some(m) = MENTIONS_TOOL.find(line) {
            push(canonicalize(&line[m.start()..]));
        }
    }
    found
}

pub fn examples(key: &str) -> &'static [&'static str] {
    match key {
        "docker_run" => &[
            "docker run nginx",
            "docker run -d -p 80:80 nginx",
            "docker container run --name web nginx",
        ],
        "docker_ps" => &["docker ps", "docker ps -a", "docker container ls"],
        "docker_build" => &[
            "docker build -t myapp .",
            "docker build -f Dockerfile.prod -t myapp:latest .",
        ],
        "kubectl_get_pods" => &[
            "kubectl get pods",
            "kubectl get po -n default",
            "kubectl get pods --all-namespaces",
        ],
        "kubectl_apply" => &[
            "kubectl apply -f deployment.yaml",
            "kubectl apply -f ./k8s/",
        ],
        _ => &[],
    }
}
