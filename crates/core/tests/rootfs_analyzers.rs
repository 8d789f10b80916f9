use std::fs;
use std::path::PathBuf;

use fwprobe_core::config::{AnalysisConfig, ToolPaths};
use fwprobe_core::report::Report;
use fwprobe_core::services::analysis::{AnalysisError, Requirements, Session, TopicAnalyzer};
use fwprobe_core::services::analyzers::network_services::{
    classify_password_hash, parse_accounts, NetworkServicesAnalyzer,
};
use fwprobe_core::services::analyzers::rootfs::{gpl_binaries, parse_release, RootfsAnalyzer};
use serde_json::{Map, Value};
use tempfile::TempDir;

/// A session whose work dir already holds `fw.img.extracted/squashfs-root`,
/// so no binwalk run is needed.
struct Fixture {
    _temp: TempDir,
    session: Session,
    firmware: PathBuf,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        Self::with_tools(|_| ToolPaths::default())
    }

    fn with_tools(tools: impl FnOnce(&std::path::Path) -> ToolPaths) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AnalysisConfig {
            work_dir: PathBuf::from("work"),
            output_dir: PathBuf::from("out"),
            results_dir: PathBuf::from("results"),
            tools: tools(temp.path()),
            ..AnalysisConfig::default()
        };
        let session = Session::new(config, temp.path());
        let firmware = temp.path().join("fw.img");
        fs::write(&firmware, vec![0u8; 2048]).expect("write firmware");
        let root =
            session.layout.extractions_dir.join("fw.img.extracted").join("squashfs-root");
        fs::create_dir_all(&root).expect("create rootfs");
        Self { _temp: temp, session, firmware, root }
    }

    fn write(&self, rel: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(&path, contents).expect("write fixture file");
        path
    }

    fn report(&self, analyzer: &dyn TopicAnalyzer) -> Map<String, Value> {
        let output = self.session.run(analyzer, Some(&self.firmware)).expect("analysis runs");
        output.report.to_map(true).expect("report map")
    }
}

fn names(list: &Value) -> Vec<&str> {
    list.as_array()
        .expect("array")
        .iter()
        .map(|item| item["name"].as_str().expect("name"))
        .collect()
}

#[test]
fn password_hash_classification() {
    for locked in ["", "*", "!"] {
        assert_eq!(
            classify_password_hash(locked, 13),
            ("locked", "No password / locked".to_string())
        );
    }
    assert_eq!(classify_password_hash("x", 13), ("shadow", "Password in shadow file".to_string()));
    assert_eq!(
        classify_password_hash("abc123", 13),
        ("weak", "Weak/short hash (potential issue)".to_string())
    );
    let sha512 = "$6$saltsalt$Zm9vYmFyYmF6cXV4cXV1eGZvb2Jhcg";
    assert_eq!(classify_password_hash(sha512, 13), ("sha512", "SHA-512 hash (strong)".to_string()));
    assert_eq!(classify_password_hash("$1$saltsalt$abcdefghijk", 13).0, "md5");
    assert_eq!(classify_password_hash("$y$j9T$abcdefghijklmnop", 13).0, "yescrypt");
    assert_eq!(
        classify_password_hash("$2b$10$abcdefghijklmnopqrstuv", 13),
        ("unknown", "Unknown hash type $2b".to_string())
    );
}

#[test]
fn accounts_take_hashes_from_shadow() {
    let passwd = "\
root:x:0:0:root:/root:/bin/ash
daemon:*:1:1:daemon:/var:/bin/false
nobody:x:65534:65534:nobody:/var:/usr/sbin/nologin
guest:abc123:1000:1000:guest:/home/guest:/bin/sh
broken:x:notanumber
";
    let shadow = "root:$6$saltsalt$Zm9vYmFyYmF6cXV4cXV1eGZvb2Jhcg:19000:0:99999:7:::\nnobody:!:19000::::::\n";
    let accounts = parse_accounts(passwd, Some(shadow), 13);

    let summary: Vec<(&str, &str, bool)> = accounts
        .iter()
        .map(|a| (a.username.as_str(), a.hash_type.as_str(), a.login_shell))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("root", "sha512", true),
            ("daemon", "locked", false),
            ("nobody", "locked", false),
            ("guest", "weak", true),
        ]
    );
    assert_eq!(accounts[0].home, "/root");
    assert_eq!(accounts[2].uid, 65534);

    let without_shadow = parse_accounts("root:x:0:0:root:/root:/bin/ash\n", None, 13);
    assert_eq!(without_shadow[0].hash_type, "shadow");
}

#[test]
fn network_services_inventory() {
    let fx = Fixture::new();
    fx.write("etc/init.d/dropbear", "#!/bin/sh /etc/rc.common\nSTART=19\n");
    fx.write("etc/init.d/nginx", "#!/bin/sh /etc/rc.common\nSTART=50\n");
    fx.write("etc/rc.d/S50nginx", "#!/bin/sh /etc/rc.common\nSTART=50\n");
    fx.write("usr/sbin/dropbear", b"\x7fELF");
    fx.write("usr/sbin/nginx", b"\x7fELF");
    fx.write("etc/nginx/nginx.conf", "server {\n    listen 443 ssl;\n    listen 80;\n}\n");
    fx.write("etc/passwd", "root:x:0:0:root:/root:/bin/ash\n");
    fx.write("etc/shadow", "root:$6$saltsalt$Zm9vYmFyYmF6cXV4cXV1eGZvb2Jhcg:19000:0:99999:7:::\n");

    let map = fx.report(&NetworkServicesAnalyzer);

    assert_eq!(map["init_script_count"], 2);
    let services = map["services"].as_array().expect("services");
    assert_eq!(services[0]["name"], "dropbear");
    assert_eq!(services[0]["enabled"], false);
    assert_eq!(services[1]["name"], "nginx");
    assert_eq!(services[1]["enabled"], true);
    assert_eq!(services[1]["path"], "etc/init.d/nginx");

    assert_eq!(names(&map["daemons"]), vec!["dropbear", "nginx"]);
    assert_eq!(map["daemons"][1]["path"], "usr/sbin/nginx");

    let ports: Vec<u64> = map["listening_ports"]
        .as_array()
        .expect("ports")
        .iter()
        .map(|p| p["port"].as_u64().expect("port"))
        .collect();
    assert_eq!(ports, vec![80, 443]);
    assert_eq!(map["listening_ports"][0]["file"], "etc/nginx/nginx.conf");

    assert_eq!(map["account_count"], 1);
    assert_eq!(map["root_hash_type"], "sha512");
    assert_eq!(map["accounts_source"], "squashfs-root/etc/passwd + etc/shadow");
}

#[test]
fn missing_squashfs_root_is_reported() {
    let fx = Fixture::new();
    fs::remove_dir_all(&fx.root).expect("remove rootfs");
    let err = match fx.session.run(&RootfsAnalyzer, Some(&fx.firmware)) {
        Ok(_) => panic!("analysis should fail without squashfs-root"),
        Err(err) => err,
    };
    assert!(matches!(err, AnalysisError::SquashfsRootMissing(_)));
}

#[test]
fn release_files_strip_quotes() {
    let release = parse_release("NAME=\"GL.iNet KVM\"\nVERSION='1.2.3'\nID=glkvm\n# comment=1\n\n");
    assert_eq!(release.get("NAME").map(String::as_str), Some("GL.iNet KVM"));
    assert_eq!(release.get("VERSION").map(String::as_str), Some("1.2.3"));
    assert_eq!(release.get("ID").map(String::as_str), Some("glkvm"));
    assert_eq!(release.len(), 3);
}

#[test]
fn gpl_binaries_read_versions_from_strings() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    fs::create_dir_all(root.join("bin")).expect("bin");
    fs::create_dir_all(root.join("usr/sbin")).expect("usr/sbin");
    fs::write(root.join("bin/busybox"), b"\x7fELF\x00\x00BusyBox v1.36.1 (2024-01-01) multi-call binary\x00")
        .expect("busybox");
    fs::write(root.join("usr/sbin/dnsmasq"), b"\x00\x01no version here\x00").expect("dnsmasq");

    let found = gpl_binaries(root, 4);
    let summary: Vec<(&str, Option<&str>, &str)> =
        found.iter().map(|b| (b.name.as_str(), b.version.as_deref(), b.path.as_str())).collect();
    assert_eq!(
        summary,
        vec![
            ("busybox", Some("1.36.1"), "bin/busybox"),
            ("dnsmasq", None, "usr/sbin/dnsmasq"),
        ]
    );
    assert_eq!(found[0].license, "GPL-2.0");
}

#[test]
fn gpl_binaries_leave_out_permissively_licensed_tools() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    fs::create_dir_all(root.join("usr/sbin")).expect("usr/sbin");
    fs::write(root.join("usr/sbin/dropbear"), b"\x00Dropbear sshd v2022.83\x00").expect("dropbear");
    fs::write(root.join("usr/sbin/hostapd"), b"\x00hostapd v2.10\x00").expect("hostapd");
    fs::write(root.join("usr/sbin/opkg"), b"\x00opkg version 2021-06-13\x00").expect("opkg");

    let found = gpl_binaries(root, 4);
    let names: Vec<&str> = found.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["opkg"]);
    assert_eq!(found[0].version.as_deref(), Some("2021-06-13"));
    assert!(found.iter().all(|b| b.license.contains("GPL")));
}

#[cfg(unix)]
#[test]
fn rootfs_inventory() {
    use std::os::unix::fs::{symlink, PermissionsExt};

    let fx = Fixture::new();
    fx.write("etc/os-release", "NAME=\"GL.iNet KVM\"\nVERSION=\"1.2.3\"\nHOME_URL=\"https://www.gl-inet.com\"\n");
    fx.write("etc/openwrt_release", "DISTRIB_ID='OpenWrt'\nDISTRIB_RELEASE='21.02'\n");
    fs::create_dir_all(fx.root.join("lib/modules/5.10.110")).expect("modules dir");
    let busybox = fx.write("bin/busybox", b"\x7fELF\x00BusyBox v1.36.1 (2024-01-01)\x00");
    fs::set_permissions(&busybox, fs::Permissions::from_mode(0o4755)).expect("chmod");
    symlink("busybox", fx.root.join("bin/sh")).expect("symlink");

    let map = fx.report(&RootfsAnalyzer);

    assert_eq!(map["os_name"], "GL.iNet KVM");
    assert_eq!(map["os_version"], "1.2.3");
    assert_eq!(map["kernel_version"], "5.10.110");
    assert_eq!(map["busybox_version"], "1.36.1");
    assert_eq!(map["release"]["DISTRIB_ID"], "OpenWrt");
    assert!(map["release"].get("HOME_URL").is_none());

    // etc, lib, lib/modules, lib/modules/5.10.110, bin
    assert_eq!(map["statistics"]["directories"], 5);
    assert_eq!(map["statistics"]["files"], 3);
    assert_eq!(map["statistics"]["symlinks"], 1);

    let setuid = map["setuid_binaries"].as_array().expect("setuid list");
    assert_eq!(setuid.len(), 1);
    assert_eq!(setuid[0]["path"], "bin/busybox");
    assert_eq!(setuid[0]["mode"], "4755");
    assert_eq!(setuid[0]["setgid"], false);

    assert_eq!(names(&map["gpl_binaries"]), vec!["busybox"]);
}

#[test]
fn extraction_dir_is_reused_when_present() {
    let fx = Fixture::new();
    fx.write("etc/passwd", "root:x:0:0:root:/root:/bin/ash\n");
    let ctx = fx
        .session
        .context(Requirements { extraction: true, offsets: false }, Some(&fx.firmware))
        .expect("context");
    let extraction = ctx.extraction_dir.as_deref().expect("extraction dir");
    assert_eq!(extraction, fx.root.parent().expect("parent"));
    assert_eq!(ctx.squashfs_root("test").expect("root"), fx.root);
    assert!(ctx.offsets.is_none());
    assert_eq!(ctx.firmware.size, 2048);
}

#[cfg(unix)]
fn fake_tool(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write fake tool");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
    path
}

#[cfg(unix)]
#[test]
fn proprietary_blob_inventory() {
    use fwprobe_core::services::analyzers::proprietary_blobs::ProprietaryBlobsAnalyzer;

    let fx = Fixture::with_tools(|base| {
        let strings = fake_tool(
            base,
            "fake-strings",
            "for last; do :; done\ncase \"$last\" in\n  *rknpu.ko) printf 'license=Proprietary\\nvermagic=5.10.110 SMP\\n' ;;\n  *) printf 'license=GPL\\nauthor=Linux\\n' ;;\nesac\n",
        );
        let file = fake_tool(base, "fake-file", "echo 'ELF 64-bit LSB shared object, ARM aarch64'\n");
        ToolPaths { strings, file, ..ToolPaths::default() }
    });
    fx.write("lib/modules/5.10.110/extra/rknpu.ko", b"\x7fELF");
    fx.write("lib/modules/5.10.110/kernel/drivers/usb.ko", b"\x7fELF");
    fx.write("usr/lib/librga.so.2", b"\x7fELF");
    fx.write("usr/lib/libc.so", b"\x7fELF");
    fx.write("usr/bin/rkipc", b"\x7fELF");
    fx.write("usr/bin/ls", b"\x7fELF");
    fx.write("lib/firmware/brcm/fw.bin", vec![0u8; 16]);

    let map = fx.report(&ProprietaryBlobsAnalyzer);

    assert_eq!(names(&map["kernel_modules"]), vec!["rknpu", "usb"]);
    assert_eq!(map["kernel_modules"][0]["license"], "Proprietary");
    assert_eq!(map["kernel_modules"][0]["proprietary"], true);
    assert_eq!(map["kernel_modules"][1]["author"], "Linux");
    assert_eq!(map["kernel_modules"][1]["proprietary"], false);
    assert_eq!(map["proprietary_module_count"], 1);

    assert_eq!(names(&map["vendor_libraries"]), vec!["librga.so.2"]);
    assert_eq!(map["vendor_libraries"][0]["vendor"], "Rockchip");
    assert_eq!(map["vendor_libraries"][0]["file_type"], "ELF 64-bit LSB shared object, ARM aarch64");
    assert_eq!(names(&map["vendor_binaries"]), vec!["rkipc"]);

    assert_eq!(map["firmware_blob_count"], 1);
    assert_eq!(map["firmware_blobs"][0]["path"], "lib/firmware/brcm/fw.bin");
    assert_eq!(map["firmware_blobs"][0]["size"], 16);
}

#[test]
fn missing_strings_tool_fails_the_blob_report() {
    use fwprobe_core::services::analyzers::proprietary_blobs::ProprietaryBlobsAnalyzer;

    let fx = Fixture::with_tools(|base| ToolPaths {
        strings: base.join("no-such-strings"),
        ..ToolPaths::default()
    });
    fx.write("lib/modules/5.10.110/extra/rknpu.ko", b"\x7fELF");
    let err = match fx.session.run(&ProprietaryBlobsAnalyzer, Some(&fx.firmware)) {
        Ok(_) => panic!("a missing strings binary should fail the report"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("strings not found"), "unexpected error: {err}");
}
