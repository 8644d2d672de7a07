//! Type-registry export as XML, and a reader for it.
//!
//! `export-type-info` dumps every class record (names, families,
//! inheritance, aliases, members, method names and arities, delegate
//! signatures) as an XML tree. The reader parses exactly this dialect
//! back into [`TypeSummary`] records, so exporting and re-importing is
//! a fixed point over the class signatures.

use quill_core::TypeFamily;

use crate::registry::Registry;

/// The signature-level view of one type, as carried by the XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSummary {
    pub name: String,
    pub family: String,
    pub base: Option<String>,
    pub native: bool,
    pub aliases: Vec<String>,
    /// Member variables as (type label, name).
    pub members: Vec<(String, String)>,
    /// Functions as (name, arity).
    pub methods: Vec<(String, usize)>,
    /// Canonical structural signature for delegate/thread families.
    pub signature: Option<String>,
}

fn family_label(family: TypeFamily) -> &'static str {
    match family {
        TypeFamily::Undefined => "undefined",
        TypeFamily::Integral => "integral",
        TypeFamily::Class => "class",
        TypeFamily::Interface => "interface",
        TypeFamily::Thread => "thread",
        TypeFamily::Delegate => "delegate",
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Summaries straight from the live registry, for comparison against a
/// parsed export.
pub fn registry_summaries(registry: &Registry) -> Vec<TypeSummary> {
    registry
        .classes
        .iter()
        .map(|class| TypeSummary {
            name: class.name.clone(),
            family: family_label(class.family).to_string(),
            base: class.base.map(|b| registry.type_name(b).to_string()),
            native: class.native,
            aliases: class.aliases.clone(),
            members: class
                .members
                .iter()
                .map(|m| (registry.type_name(m.type_id).to_string(), m.name.clone()))
                .collect(),
            methods: class
                .funcs
                .iter()
                .filter(|f| !f.is_anonymous)
                .map(|f| (f.name.clone(), f.args.len()))
                .collect(),
            signature: class
                .signature
                .as_ref()
                .map(|sig| registry.signature_name(class.family, sig)),
        })
        .collect()
}

/// Render the registry as an XML tree.
pub fn to_xml(registry: &Registry) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\"?>\n<typeinfo>\n");
    for summary in registry_summaries(registry) {
        out.push_str(&format!(
            "  <type name=\"{}\" family=\"{}\" native=\"{}\"",
            escape(&summary.name),
            summary.family,
            summary.native
        ));
        if let Some(base) = &summary.base {
            out.push_str(&format!(" base=\"{}\"", escape(base)));
        }
        if let Some(sig) = &summary.signature {
            out.push_str(&format!(" signature=\"{}\"", escape(sig)));
        }
        out.push_str(">\n");
        for alias in &summary.aliases {
            out.push_str(&format!("    <alias name=\"{}\" />\n", escape(alias)));
        }
        for (type_label, name) in &summary.members {
            out.push_str(&format!(
                "    <member type=\"{}\" name=\"{}\" />\n",
                escape(type_label),
                escape(name)
            ));
        }
        for (name, arity) in &summary.methods {
            out.push_str(&format!(
                "    <function name=\"{}\" args=\"{}\" />\n",
                escape(name),
                arity
            ));
        }
        out.push_str("  </type>\n");
    }
    out.push_str("</typeinfo>\n");
    out
}

/// Parse a type-info export back into summaries.
pub fn parse_type_info(xml: &str) -> Result<Vec<TypeSummary>, String> {
    let mut out: Vec<TypeSummary> = Vec::new();
    let mut cursor = 0usize;
    while let Some(tag) = next_tag(xml, &mut cursor)? {
        match tag.name.as_str() {
            "type" if !tag.closing => {
                out.push(TypeSummary {
                    name: tag.attr("name").unwrap_or_default(),
                    family: tag.attr("family").unwrap_or_default(),
                    base: tag.attr("base"),
                    native: tag.attr("native").as_deref() == Some("true"),
                    aliases: Vec::new(),
                    members: Vec::new(),
                    methods: Vec::new(),
                    signature: tag.attr("signature"),
                });
            }
            "alias" => {
                let last = out.last_mut().ok_or("alias outside of a type element")?;
                last.aliases.push(tag.attr("name").unwrap_or_default());
            }
            "member" => {
                let last = out.last_mut().ok_or("member outside of a type element")?;
                last.members.push((
                    tag.attr("type").unwrap_or_default(),
                    tag.attr("name").unwrap_or_default(),
                ));
            }
            "function" => {
                let last = out.last_mut().ok_or("function outside of a type element")?;
                let arity: usize = tag
                    .attr("args")
                    .unwrap_or_default()
                    .parse()
                    .map_err(|_| "bad args attribute")?;
                last.methods.push((tag.attr("name").unwrap_or_default(), arity));
            }
            _ => {}
        }
    }
    Ok(out)
}

struct Tag {
    name: String,
    closing: bool,
    attrs: Vec<(String, String)>,
}

impl Tag {
    fn attr(&self, name: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| unescape(v))
    }
}

/// Scan the next tag; text content and processing instructions are
/// skipped.
fn next_tag(xml: &str, cursor: &mut usize) -> Result<Option<Tag>, String> {
    let bytes = xml.as_bytes();
    loop {
        let start = match xml[*cursor..].find('<') {
            Some(ofs) => *cursor + ofs,
            None => return Ok(None),
        };
        let end = xml[start..]
            .find('>')
            .map(|ofs| start + ofs)
            .ok_or("unterminated tag")?;
        *cursor = end + 1;
        if bytes.get(start + 1) == Some(&b'?') {
            continue;
        }
        let inner = xml[start + 1..end].trim_end_matches('/').trim();
        let closing = inner.starts_with('/');
        let inner = inner.trim_start_matches('/');
        let mut parts = inner.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_string();
        let mut attrs = Vec::new();
        if let Some(rest) = parts.next() {
            let mut rest = rest.trim();
            while !rest.is_empty() {
                let eq = match rest.find('=') {
                    Some(i) => i,
                    None => break,
                };
                let key = rest[..eq].trim().to_string();
                let after = rest[eq + 1..].trim_start();
                if !after.starts_with('"') {
                    return Err(format!("unquoted attribute '{}'", key));
                }
                let close = after[1..]
                    .find('"')
                    .ok_or("unterminated attribute value")?;
                let value = after[1..1 + close].to_string();
                attrs.push((key, value));
                rest = after[close + 2..].trim_start();
            }
        }
        return Ok(Some(Tag {
            name,
            closing,
            attrs,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Var;
    use crate::registry::{ClassRecord, FuncRecord, FuncSig};
    use quill_core::{TYPE_GLOBAL, TYPE_INT, TYPE_STRING};

    fn sample_registry() -> Registry {
        let mut reg = Registry::new();
        for (i, (name, family)) in [
            ("null", TypeFamily::Undefined),
            ("var", TypeFamily::Undefined),
            ("int", TypeFamily::Integral),
            ("float", TypeFamily::Integral),
            ("string", TypeFamily::Class),
            ("array", TypeFamily::Class),
            ("global", TypeFamily::Class),
            ("__delegate", TypeFamily::Delegate),
            ("exception", TypeFamily::Interface),
            ("__thread", TypeFamily::Thread),
        ]
        .into_iter()
        .enumerate()
        {
            reg.classes
                .push(ClassRecord::new(i, name, TYPE_GLOBAL, family));
        }
        reg.classes[TYPE_INT].aliases.push("bool".to_string());

        let id = reg.classes.len();
        let mut class = ClassRecord::new(id, "Box", TYPE_GLOBAL, TypeFamily::Class);
        class.members.push(Var::new("v", TYPE_INT));
        let mut ctor = FuncRecord::new(id, 0, "Box");
        ctor.is_ctor = true;
        ctor.args.push(Var::new("x", TYPE_INT));
        class.funcs.push(ctor);
        reg.classes.push(class);

        let id = reg.classes.len();
        let mut dg = ClassRecord::new(id, "delegate string(int)", TYPE_GLOBAL, TypeFamily::Delegate);
        dg.signature = Some(FuncSig {
            result: Some(Var::result(TYPE_STRING)),
            args: vec![Var::new("", TYPE_INT)],
        });
        reg.classes.push(dg);
        reg
    }

    #[test]
    fn test_round_trip_preserves_signatures() {
        let reg = sample_registry();
        let xml = to_xml(&reg);
        let parsed = parse_type_info(&xml).unwrap();
        assert_eq!(parsed, registry_summaries(&reg));
    }

    #[test]
    fn test_export_carries_delegate_signature() {
        let reg = sample_registry();
        let xml = to_xml(&reg);
        assert!(xml.contains("signature=\"delegate string(int)\""));
        assert!(xml.contains("<alias name=\"bool\" />"));
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
        assert_eq!(unescape(&escape("a<b>&\"c\"")), "a<b>&\"c\"");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_type_info("<type name=unquoted>").is_err());
        assert!(parse_type_info("<alias name=\"x\" />").is_err());
    }
}
