use anyhow::{anyhow, ensure, Result};

/// Archive file magic.
pub const AR_MAGIC: &[u8; 8] = b"!<arch>\n";

const HEADER_LEN: usize = 60;

/// One member of an archive: its trimmed name and the span of its body.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

pub fn is_archive(data: &[u8]) -> bool {
    data.len() >= AR_MAGIC.len() && &data[..AR_MAGIC.len()] == AR_MAGIC
}

/// Walk every member header in order.
///
/// Each member is a 60-byte header whose bytes 48..58 hold the ASCII
/// decimal body size; bodies of odd size are padded to the next even
/// offset.
pub fn members(data: &[u8]) -> Result<Vec<ArchiveMember>> {
    ensure!(is_archive(data), "not an archive");

    let mut out = Vec::new();
    let mut offset = AR_MAGIC.len();
    while offset < data.len() {
        let header = data
            .get(offset..offset + HEADER_LEN)
            .ok_or_else(|| anyhow!("truncated archive header"))?;

        let name = std::str::from_utf8(&header[0..16])
            .map_err(|_| anyhow!("corrupt archive member name"))?
            .trim_end()
            .trim_end_matches('/')
            .to_string();

        let size: usize = std::str::from_utf8(&header[48..58])
            .map_err(|_| anyhow!("corrupt archive member size"))?
            .trim_end()
            .parse()
            .map_err(|_| anyhow!("corrupt archive member size"))?;

        let body = offset + HEADER_LEN;
        ensure!(body + size <= data.len(), "truncated archive member");
        out.push(ArchiveMember {
            name,
            offset: body,
            size,
        });

        // odd bodies are padded to even
        offset = body + size + (size & 1);
    }
    Ok(out)
}

pub fn member_bytes<'a>(data: &'a [u8], member: &ArchiveMember) -> &'a [u8] {
    &data[member.offset..member.offset + member.size]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{:<16}", name).as_bytes());
        out.extend_from_slice(b"0           "); // date
        out.extend_from_slice(b"0     0     "); // uid gid
        out.extend_from_slice(b"100644  "); // mode
        out.extend_from_slice(format!("{:<10}", body.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        assert_eq!(out.len(), HEADER_LEN);
        out.extend_from_slice(body);
        if body.len() & 1 == 1 {
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn walks_members_with_padding() {
        let mut data = AR_MAGIC.to_vec();
        data.extend_from_slice(&member("one.o", b"abc"));
        data.extend_from_slice(&member("two.o", b"defg"));

        let members = members(&data).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "one.o");
        assert_eq!(member_bytes(&data, &members[0]), &b"abc"[..]);
        assert_eq!(members[1].name, "two.o");
        assert_eq!(member_bytes(&data, &members[1]), &b"defg"[..]);
    }

    #[test]
    fn rejects_non_archives() {
        assert!(members(b"not an archive at all").is_err());
        assert!(!is_archive(b"\x18\x0e"));
    }
}
